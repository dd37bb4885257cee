// Jackson Coxson
// Pairs with a device and persists the record.

use clap::{Arg, Command};
use idevice_usb::{DeviceError, FilePairRecordStore, LockdownClient, PairRecordStore, UsbDevice};

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("idevice-usb-pair")
        .about("Pair with the device; accept the trust dialog when it appears")
        .arg(
            Arg::new("udid")
                .value_name("UDID")
                .help("UDID of the device (defaults to the first one found)")
                .index(1),
        )
        .get_matches();

    if let Err(e) = run(matches.get_one::<String>("udid")).await {
        eprintln!("idevice-usb-pair: {e}");
        std::process::exit(1);
    }
}

async fn run(udid: Option<&String>) -> Result<(), DeviceError> {
    let device = UsbDevice::open(udid.map(String::as_str)).await?;
    let mut lockdown = LockdownClient::connect(&device).await?;

    let store = FilePairRecordStore::default_location()?;
    if store.load(device.udid())?.is_some() {
        println!("already paired with {}", device.udid());
        lockdown.close().await;
        device.close().await;
        return Ok(());
    }

    let record = lockdown.pair_with_store(&store, device.udid()).await?;

    // prove the record works before reporting success
    lockdown.start_session(&record).await?;
    println!("paired with {} (HostID {})", device.udid(), record.host_id);

    lockdown.close().await;
    device.close().await;
    Ok(())
}
