use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = ha_vm_manager::cli::run().await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
