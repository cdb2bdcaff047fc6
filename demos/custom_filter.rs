//! Only react to acquisitions whose horizontal settings changed.
//!
//! Leave the scope running, change the record length or timebase on the
//! instrument, and watch the commits arrive.

use tekhsi::{any_horizontal_change, AcqWaitOn, TekHsiConnect};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "192.168.0.1:5000".to_string());

    let mut scope = TekHsiConnect::builder(addr)
        .acq_filter(any_horizontal_change)
        .connect()
        .await?;

    for _ in 0..5 {
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
