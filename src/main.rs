use clap::Parser;

fn main() {
    let cli = vaultsync::cli::Cli::parse();
    if let Err(err) = vaultsync::app::run(cli) {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
