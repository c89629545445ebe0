//! Object-store opener interface (§6) and the write-once-then-rename
//! lifecycle (§3 Lifecycle) it underpins.
//!
//! Path resolution for local and object-store URIs is explicitly out of
//! scope (§1 "Out of scope") — the core only consumes the capability
//! interface below. [`LocalOpener`] is the one concrete implementation this
//! crate ships, covering plain filesystem paths; an object-store-backed
//! opener is a collaborator a caller can plug in without touching
//! `repack`/`index_builder`/`retrieve`.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::codec::ReadSeek;

/// Capability interface the core consumes for all durable I/O.
///
/// Mirrors §6: `open_read` returns a seekable reader, `open_write` an
/// appendable writer, plus atomic `rename` and `remove`. The core is
/// agnostic to scheme; only `LocalOpener` is provided here.
pub trait Opener: Send + Sync {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;
    fn open_write(&self, path: &Path) -> io::Result<Box<dyn io::Write>>;
    fn rename(&self, tmp: &Path, final_path: &Path) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Plain local-filesystem opener.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOpener;

impl Opener for LocalOpener {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(File::open(path)?))
    }

    fn open_write(&self, path: &Path) -> io::Result<Box<dyn io::Write>> {
        Ok(Box::new(File::create(path)?))
    }

    fn rename(&self, tmp: &Path, final_path: &Path) -> io::Result<()> {
        fs::rename(tmp, final_path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A write-once output, built on the injected [`Opener`] rather than the
/// filesystem directly: writes land at a process-scoped temporary path via
/// `opener.open_write`, and are only promoted into place by
/// [`TempOutput::commit`], which calls `opener.rename`.
///
/// This is the mechanism behind §3's "Repack writes archive and raw-index to
/// temporary paths, then renames on success" and §5's "Partial outputs are
/// never promoted over final paths": if `commit` is never called, `Drop`
/// calls `opener.remove` on the temporary path, including on any early
/// return from a fatal error or external cancellation (§5 Cancellation).
pub struct TempOutput<'a> {
    opener: &'a dyn Opener,
    writer: Box<dyn io::Write>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl<'a> TempOutput<'a> {
    pub fn new(opener: &'a dyn Opener, final_path: impl Into<PathBuf>) -> io::Result<Self> {
        let final_path = final_path.into();
        let tmp_path = tmp_path_for(&final_path);
        let writer = opener.open_write(&tmp_path)?;
        Ok(Self { opener, writer, tmp_path, final_path, committed: false })
    }

    pub fn writer(&mut self) -> &mut dyn io::Write {
        &mut *self.writer
    }

    /// Promote the temporary output to its final path. Consumes `self`; if
    /// this is never called, `Drop` removes the temporary path instead.
    pub fn commit(mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.opener.rename(&self.tmp_path, &self.final_path)?;
        self.committed = true;
        Ok(())
    }
}

impl<'a> Drop for TempOutput<'a> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.opener.remove(&self.tmp_path);
        }
    }
}

/// A process-scoped temporary path next to `final_path`, sharing its
/// directory so `rename` stays within one filesystem/bucket prefix.
fn tmp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".tmp-{}", std::process::id()));
    match final_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(name),
        _ => PathBuf::from(name),
    }
}
