use block_ingest::Config;
use clap::Parser;
use std::io::BufRead;

fn main() {
    env_logger::init();
    let config = Config::parse();

    let ctx = match block_ingest::Context::bootstrap(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    let prompt_ctx = ctx.clone();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            println!("{}", prompt_ctx.handle_command(&line));
            if line.trim() == "q" {
                break;
            }
        }
    });

    if let Err(e) = ctx.run() {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}
