//! Placeholder binary for the scrobbler library
//!
//! The real binaries are:
//! - src/daemon/main.rs (plexfmd scrobbling daemon)
//! - src/cli/main.rs (plexfm-cli history tool)

fn main() {
    eprintln!("plexfm {} ships two binaries:", plexfm::VERSION);
    eprintln!("  cargo run --bin plexfmd      # Start the scrobbling daemon");
    eprintln!("  cargo run --bin plexfm-cli   # Query scrobble history");
    eprintln!();
    eprintln!("Or install them:");
    eprintln!("  cargo install --path .");
    eprintln!("  plexfmd --help");
    eprintln!("  plexfm-cli --help");

    std::process::exit(1);
}
