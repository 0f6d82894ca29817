use block_ingest::chain::{Chain, UtxoSet};
use block_ingest::Config;
use clap::Parser;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn main() {
    env_logger::init();
    let config = Config::parse();

    let Some(legacy_dir) = config.legacy_blocks_dir.clone() else {
        eprintln!("--legacy-blocks-dir is required");
        std::process::exit(1);
    };

    let net_params = config.net_params();
    let utxo = match UtxoSet::open(config.unspent_dir()) {
        Ok(utxo) => utxo,
        Err(e) => {
            log::error!("failed to open utxo store: {e}");
            std::process::exit(1);
        }
    };
    let genesis = bitcoin::blockdata::constants::genesis_block(config.network);
    let abort = Arc::new(AtomicBool::new(false));

    let abort_for_signal = abort.clone();
    watch_stdin_for_abort(move || abort_for_signal.store(true, std::sync::atomic::Ordering::Relaxed));

    let chain = Arc::new(Chain::new(net_params, genesis.header, utxo, config.trust_up_to, abort.clone()));

    match block_ingest::importer::import_from_config(&config, chain, abort) {
        Ok(count) => {
            log::info!("import complete: {count} blocks accepted");
        }
        Err(e) => {
            log::error!("import failed: {e}");
            std::process::exit(1);
        }
    }

    let _ = legacy_dir;
}

/// A background thread that waits for stdin to produce a byte or close,
/// then runs `on_signal`. Closing stdin (or a single keypress) is enough to
/// exercise the abort-during-import path without a real signal handler.
fn watch_stdin_for_abort<F: FnOnce() + Send + 'static>(on_signal: F) {
    std::thread::spawn(move || {
        use std::io::Read;
        let mut buf = [0u8; 1];
        let _ = std::io::stdin().read(&mut buf);
        on_signal();
    });
}
