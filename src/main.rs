fn main() {
    std::process::exit(gzipi::cli::run());
}
