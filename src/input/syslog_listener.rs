use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use super::InputError;
use crate::models::RawLine;

/// Largest datagram accepted; RFC 5424 receivers must handle at least 2048 bytes
const MAX_DATAGRAM: usize = 65_535;

/// UDP syslog listener delivering each received line as a [`RawLine`]
pub struct SyslogListener {
    socket: UdpSocket,
}

impl SyslogListener {
    pub async fn bind(address: &str) -> Result<Self, InputError> {
        let socket = UdpSocket::bind(address).await?;
        Ok(SyslogListener { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, InputError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive until the channel closes or `shutdown` flips to true.
    ///
    /// A datagram carrying several newline-separated messages yields one line per message.
    pub async fn run(
        &self,
        tx: mpsc::Sender<RawLine>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), InputError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        log::info!("Syslog listener started on {}", self.local_addr()?);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let (len, addr) = tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        log::error!("Error receiving syslog message: {}", e);
                        continue;
                    }
                },
                _ = shutdown.changed() => continue,
            };

            let message = String::from_utf8_lossy(&buf[..len]);
            let source = format!("syslog:{}", addr.ip());

            for line in message.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()) {
                if tx.send(RawLine::now(line, source.clone())).await.is_err() {
                    log::info!("Channel closed, stopping syslog listener");
                    return Err(InputError::ChannelClosed);
                }
            }
        }

        log::info!("Syslog listener stopped");
        Ok(())
    }
}
