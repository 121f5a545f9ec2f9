use instrument_manager::{CliOptions, EXIT_OK, EXIT_USAGE, USAGE};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        std::process::exit(EXIT_OK);
    }

    let options = match CliOptions::parse(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(EXIT_USAGE);
        }
    };

    std::process::exit(instrument_manager::run(options));
}
