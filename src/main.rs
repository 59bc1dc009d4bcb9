//! # Terraform Controller
//!
//! Controller process: initializes the runtime, then runs the watch loop
//! until SIGTERM or Ctrl-C.

use anyhow::Result;
use tf_controller::runtime::initialization::initialize;
use tf_controller::runtime::watch_loop::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    let init_result = initialize().await?;
    run_watch_loop(init_result).await
}
