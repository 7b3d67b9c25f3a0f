//! portforward - bidirectional TCP/UDP port forwarder.

use clap::Parser;
use portforward::{logging, Cli, Controller, ForwardArgs};
use std::sync::Arc;

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let args = ForwardArgs::from(&cli);

    let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    runtime.block_on(async {
        let controller = Arc::new(Controller::new());

        // An interrupt requests a stop of the active driver; listeners
        // observe it within their accept deadline.
        let signal_controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                signal_controller.shutdown();
            }
        });

        if let Err(e) = controller.launch(args).await {
            tracing::error!("{}", e);
        }
    });
}
