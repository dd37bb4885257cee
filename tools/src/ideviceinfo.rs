// Jackson Coxson
// Queries lockdown values, like libimobiledevice's ideviceinfo.

use clap::{Arg, Command};
use idevice_usb::{DeviceError, FilePairRecordStore, LockdownClient, PairRecordStore, UsbDevice};

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("idevice-usb-info")
        .about("Get information from the device over raw USB")
        .arg(
            Arg::new("udid")
                .long("udid")
                .short('u')
                .value_name("UDID")
                .help("UDID of the device (defaults to the first one found)"),
        )
        .arg(
            Arg::new("key")
                .long("key")
                .short('k')
                .value_name("KEY")
                .help("Only query KEY instead of the whole dictionary"),
        )
        .arg(
            Arg::new("domain")
                .long("domain")
                .short('q')
                .value_name("DOMAIN")
                .help("Query DOMAIN, e.g. com.apple.mobile.battery"),
        )
        .arg(
            Arg::new("session")
                .long("session")
                .help("Start a session with the stored pair record first")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Err(e) = run(&matches).await {
        eprintln!("idevice-usb-info: {e}");
        std::process::exit(1);
    }
}

async fn run(matches: &clap::ArgMatches) -> Result<(), DeviceError> {
    let udid = matches.get_one::<String>("udid");
    let key = matches.get_one::<String>("key");
    let domain = matches.get_one::<String>("domain");

    let device = UsbDevice::open(udid.map(String::as_str)).await?;
    let mut lockdown = LockdownClient::connect(&device).await?;

    if matches.get_flag("session") {
        let store = FilePairRecordStore::default_location()?;
        let record = store
            .load(device.udid())?
            .ok_or(DeviceError::InvalidPairRecord)?;
        lockdown.start_session(&record).await?;
    }

    let value = lockdown
        .get_value(key.map(String::as_str), domain.map(String::as_str))
        .await?;
    match value.as_string() {
        Some(s) => println!("{s}"),
        None => println!("{value:#?}"),
    }

    lockdown.close().await;
    device.close().await;
    Ok(())
}
