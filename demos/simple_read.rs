//! Pull one acquisition from an instrument and print what arrived.
//!
//! Usage: `cargo run --example simple_read -- 192.168.0.1:5000`

use tekhsi::{AcqWaitOn, TekHsiConnect};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "192.168.0.1:5000".to_string());

    let mut scope = TekHsiConnect::connect(addr).await?;
    {
        let access = scope.access_data(AcqWaitOn::NewData).await?;
        println!("acquisition {}", access.trans_id());
        for symbol in access.bundle().symbols() {
            if let Ok(wfm) = access.get_data(symbol) {
                println!("  {symbol}: {} samples", wfm.record_length());
            }
        }
    }
    scope.close().await?;
    Ok(())
}
