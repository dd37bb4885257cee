// Jackson Coxson

//! End-to-end exercises of the public stack: mux transport, lockdown and
//! AFC framing against a scripted fake device on the far side of an
//! in-memory pipe.

use idevice_usb::mux::packet::{MuxHeader, MuxPacket, FLAG_ACK, FLAG_SYN, HEADER_SIZE};
use idevice_usb::mux::MuxTransport;
use idevice_usb::services::afc::opcode::AfcOpcode;
use idevice_usb::services::afc::AfcClient;
use idevice_usb::{DeviceConnection, LockdownClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Device-side view of one mux connection.
struct FakeConn {
    host_port: u16,
    dev_port: u16,
    /// Payload bytes this side has sent.
    sent: u32,
    /// Payload bytes received from the host.
    rcvd: u32,
    buf: Vec<u8>,
}

async fn read_packet(stream: &mut DuplexStream) -> (MuxHeader, Vec<u8>) {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await.unwrap();
    let header = MuxHeader::parse(&header).unwrap();
    let mut payload = vec![0u8; header.payload_len()];
    stream.read_exact(&mut payload).await.unwrap();
    (header, payload)
}

/// Waits for a SYN to `dev_port`, answers SYN+ACK. Pure ACKs from other
/// connections are skipped.
async fn accept(stream: &mut DuplexStream, dev_port: u16) -> FakeConn {
    loop {
        let (header, payload) = read_packet(stream).await;
        if header.flags & FLAG_SYN != 0 {
            assert_eq!(header.dest_port, dev_port);
            let pkt = MuxPacket {
                source_port: dev_port,
                dest_port: header.source_port,
                seq: 0,
                ack: 0,
                flags: FLAG_SYN | FLAG_ACK,
                window: 0xf000,
                payload: &[],
            };
            stream.write_all(&pkt.encode()).await.unwrap();
            return FakeConn {
                host_port: header.source_port,
                dev_port,
                sent: 0,
                rcvd: 0,
                buf: Vec::new(),
            };
        }
        assert!(payload.is_empty(), "unexpected data while accepting");
    }
}

impl FakeConn {
    /// Buffers host payload until `n` bytes are available.
    async fn recv_bytes(&mut self, stream: &mut DuplexStream, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            let (header, payload) = read_packet(stream).await;
            if payload.is_empty() {
                continue; // flow-control ack
            }
            assert_eq!(header.source_port, self.host_port);
            assert_eq!(header.dest_port, self.dev_port);
            assert_eq!(header.seq, self.rcvd, "host payload out of order");
            self.rcvd += payload.len() as u32;
            self.buf.extend_from_slice(&payload);
        }
        self.buf.drain(..n).collect()
    }

    async fn recv_plist(&mut self, stream: &mut DuplexStream) -> plist::Dictionary {
        let len = self.recv_bytes(stream, 4).await;
        let len = u32::from_be_bytes(len.try_into().unwrap()) as usize;
        let payload = self.recv_bytes(stream, len).await;
        plist::from_bytes(&payload).unwrap()
    }

    async fn send_bytes(&mut self, stream: &mut DuplexStream, bytes: &[u8]) {
        let pkt = MuxPacket {
            source_port: self.dev_port,
            dest_port: self.host_port,
            seq: self.sent,
            ack: self.rcvd,
            flags: FLAG_ACK,
            window: 0xf000,
            payload: bytes,
        };
        stream.write_all(&pkt.encode()).await.unwrap();
        self.sent += bytes.len() as u32;
    }

    async fn send_plist(&mut self, stream: &mut DuplexStream, dict: plist::Dictionary) {
        let mut payload = Vec::new();
        plist::Value::Dictionary(dict)
            .to_writer_xml(&mut payload)
            .unwrap();
        let mut framed = (payload.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&payload);
        self.send_bytes(stream, &framed).await;
    }
}

fn dict(pairs: &[(&str, plist::Value)]) -> plist::Dictionary {
    let mut d = plist::Dictionary::new();
    for (k, v) in pairs {
        d.insert((*k).into(), v.clone());
    }
    d
}

const AFC_PORT: u16 = 49431;

async fn fake_device(mut stream: DuplexStream) {
    // lockdown connection
    let mut lockdown = accept(&mut stream, 62078).await;

    let req = lockdown.recv_plist(&mut stream).await;
    assert_eq!(
        req.get("Request").and_then(|r| r.as_string()),
        Some("QueryType")
    );
    lockdown
        .send_plist(
            &mut stream,
            dict(&[
                ("Request", "QueryType".into()),
                ("Type", "com.apple.mobile.lockdown".into()),
            ]),
        )
        .await;

    let req = lockdown.recv_plist(&mut stream).await;
    assert_eq!(
        req.get("Key").and_then(|k| k.as_string()),
        Some("DeviceName")
    );
    lockdown
        .send_plist(
            &mut stream,
            dict(&[
                ("Request", "GetValue".into()),
                ("Value", "Rusty iPhone".into()),
            ]),
        )
        .await;

    let req = lockdown.recv_plist(&mut stream).await;
    assert_eq!(
        req.get("Service").and_then(|s| s.as_string()),
        Some("com.apple.afc")
    );
    lockdown
        .send_plist(
            &mut stream,
            dict(&[
                ("Request", "StartService".into()),
                ("Service", "com.apple.afc".into()),
                ("Port", (AFC_PORT as u64).into()),
            ]),
        )
        .await;

    // afc connection on the advertised port
    let mut afc = accept(&mut stream, AFC_PORT).await;
    let header = afc.recv_bytes(&mut stream, 40).await;
    assert_eq!(&header[0..8], b"CFA6LPAA");
    let operation = u64::from_le_bytes(header[32..40].try_into().unwrap());
    assert_eq!(operation, AfcOpcode::GetDevInfo as u64);

    let payload: &[u8] =
        b"Model\0iPhone1,1\0FSTotalBytes\08000000000\0FSFreeBytes\04000000000\0FSBlockSize\04096\0";
    let mut response = Vec::new();
    response.extend_from_slice(&0x4141504c36414643u64.to_le_bytes());
    response.extend_from_slice(&(40 + payload.len() as u64).to_le_bytes());
    response.extend_from_slice(&40u64.to_le_bytes());
    response.extend_from_slice(&0u64.to_le_bytes());
    response.extend_from_slice(&(AfcOpcode::Data as u64).to_le_bytes());
    response.extend_from_slice(payload);
    afc.send_bytes(&mut stream, &response).await;
}

#[tokio::test]
async fn lockdown_session_and_afc_over_mux() {
    let (host, device) = tokio::io::duplex(1 << 16);
    let (input, output) = tokio::io::split(host);
    let transport = MuxTransport::start(Box::new(input), Box::new(output));
    let device_task = tokio::spawn(fake_device(device));

    let socket = transport.connect(62078).await.unwrap();
    let mut lockdown = LockdownClient::from_socket(Box::new(socket), "session-test")
        .await
        .unwrap();

    let name = lockdown.get_value(Some("DeviceName"), None).await.unwrap();
    assert_eq!(name.as_string(), Some("Rusty iPhone"));

    let handle = lockdown.start_service("com.apple.afc").await.unwrap();
    assert_eq!(handle.port, AFC_PORT);
    assert!(!handle.requires_tls);

    let afc_socket = transport.connect(handle.port).await.unwrap();
    let mut afc = AfcClient::new(DeviceConnection::new(Box::new(afc_socket), "session-test"));
    let info = afc.get_device_info().await.unwrap();
    assert_eq!(info.model, "iPhone1,1");
    assert_eq!(info.total_bytes, 8_000_000_000);
    assert_eq!(info.free_bytes, 4_000_000_000);
    assert_eq!(info.block_size, 4096);

    device_task.await.unwrap();
}
