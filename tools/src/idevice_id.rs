// Jackson Coxson
// Lists the UDIDs of devices attached over USB.

use idevice_usb::usb;

#[tokio::main]
async fn main() {
    env_logger::init();

    let devices = match usb::list_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            eprintln!("idevice-usb-id: {e}");
            std::process::exit(1);
        }
    };
    for device in devices {
        println!("{}", device.udid());
    }
}
