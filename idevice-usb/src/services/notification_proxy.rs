// Jackson Coxson

//! Notification proxy client: observe and post system notifications.
//!
//! Common identifiers:
//! - Posted by the host: `com.apple.itunes-mobdev.syncWillStart`,
//!   `com.apple.itunes-mobdev.syncDidStart`,
//!   `com.apple.itunes-mobdev.syncDidFinish`
//! - Observed from the device: `com.apple.itunes-client.syncCancelRequest`,
//!   `com.apple.mobile.lockdown.device_name_changed`,
//!   `com.apple.mobile.application_installed`

use std::sync::Arc;

use log::debug;
use plist::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::{DeviceConnection, DeviceError};

/// Client for the notification proxy service.
#[derive(Debug)]
pub struct NotificationProxyClient {
    pub connection: DeviceConnection,
}

impl super::ServiceClient for NotificationProxyClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.notification_proxy"
    }

    fn from_connection(connection: DeviceConnection) -> Self {
        Self::new(connection)
    }
}

impl NotificationProxyClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    fn command(name: &str, notification: Option<&str>) -> plist::Dictionary {
        let mut dict = plist::Dictionary::new();
        dict.insert("Command".into(), name.into());
        if let Some(notification) = notification {
            dict.insert("Name".into(), notification.into());
        }
        dict
    }

    /// Posts a notification to the device.
    pub async fn post_notification(
        &mut self,
        notification: impl AsRef<str>,
    ) -> Result<(), DeviceError> {
        let dict = Self::command("PostNotification", Some(notification.as_ref()));
        self.connection.send_plist(Value::Dictionary(dict)).await
    }

    /// Registers interest in a notification; pair with
    /// `receive_notification` or [`NotificationProxyClient::listen`].
    pub async fn observe_notification(
        &mut self,
        notification: impl AsRef<str>,
    ) -> Result<(), DeviceError> {
        let dict = Self::command("ObserveNotification", Some(notification.as_ref()));
        self.connection.send_plist(Value::Dictionary(dict)).await
    }

    /// Blocks until the device relays an observed notification.
    pub async fn receive_notification(&mut self) -> Result<String, DeviceError> {
        let res = self.connection.read_plist().await?;
        match res.get("Command").and_then(|c| c.as_string()) {
            Some("RelayNotification") => res
                .get("Name")
                .and_then(|n| n.as_string())
                .map(ToOwned::to_owned)
                .ok_or_else(|| {
                    DeviceError::Unknown("relayed notification had no name".to_string())
                }),
            Some("ProxyDeath") => Err(DeviceError::MuxError(
                "notification proxy shut down".to_string(),
            )),
            _ => Err(DeviceError::Unknown(
                "unexpected notification proxy message".to_string(),
            )),
        }
    }

    /// Tells the proxy to shut down, then closes the connection.
    pub async fn shutdown(mut self) -> Result<(), DeviceError> {
        let dict = Self::command("Shutdown", None);
        self.connection.send_plist(Value::Dictionary(dict)).await?;
        self.connection.close().await
    }

    /// Spawns a listener task that invokes `callback` for every relayed
    /// notification until the stream ends or the listener is stopped.
    pub fn listen<F>(mut self, mut callback: F) -> NotificationListener
    where
        F: FnMut(String) + Send + 'static,
    {
        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    res = self.receive_notification() => match res {
                        Ok(name) => callback(name),
                        Err(e) => {
                            debug!("notification stream ended: {e}");
                            break;
                        }
                    }
                }
            }
            self
        });
        NotificationListener { stop, handle }
    }
}

/// Owned handle to a running notification listener task.
///
/// Shutdown is cooperative: the stop signal makes the loop exit at the
/// next message boundary, and [`NotificationListener::stop`] joins the
/// task and hands the client back.
pub struct NotificationListener {
    stop: Arc<Notify>,
    handle: JoinHandle<NotificationProxyClient>,
}

impl NotificationListener {
    pub async fn stop(self) -> Result<NotificationProxyClient, DeviceError> {
        self.stop.notify_one();
        self.handle
            .await
            .map_err(|e| DeviceError::Unknown(format!("listener task failed: {e}")))
    }
}
