use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::drivers::hub::HubConfig;
use crate::drivers::vms::VmsConfig;
use crate::drivers::RawFrame;
use crate::model::Connector;
use crate::store::CredentialStore;

use super::{SessionError, CONNECT_TIMEOUT, IDLE_GRACE, KEEPALIVE, SUBSCRIBE_TIMEOUT};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One live upstream link, already subscribed to its event source.
pub(super) enum Transport {
    Mqtt {
        client: AsyncClient,
        eventloop: EventLoop,
        /// Frames that arrived while the handshake was still completing.
        pending: VecDeque<RawFrame>,
    },
    Ws(WsStream),
}

impl Transport {
    /// How long a silent link is tolerated before it is recycled.
    pub fn idle_timeout(&self) -> Duration {
        KEEPALIVE + IDLE_GRACE
    }

    /// Next raw frame; `Ok(None)` means the peer closed cleanly.
    pub async fn next_frame(&mut self) -> Result<Option<RawFrame>, SessionError> {
        match self {
            Transport::Mqtt { eventloop, pending, .. } => {
                if let Some(frame) = pending.pop_front() {
                    return Ok(Some(frame));
                }
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            return Ok(Some(RawFrame::Mqtt {
                                topic: publish.topic,
                                payload: publish.payload.to_vec(),
                            }));
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => return Ok(None),
                        Ok(_) => continue,
                        Err(e) => return Err(SessionError::Transport(e.to_string())),
                    }
                }
            }
            Transport::Ws(stream) => loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(RawFrame::Text(text))),
                    Some(Ok(Message::Ping(payload))) => {
                        // Answer keepalives ourselves; the read loop owns
                        // the socket.
                        let _ = stream.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(SessionError::Transport(e.to_string())),
                }
            },
        }
    }

    pub async fn shutdown(self) {
        match self {
            Transport::Mqtt { client, .. } => {
                let _ = client.disconnect().await;
            }
            Transport::Ws(mut stream) => {
                let _ = stream.close(None).await;
            }
        }
    }
}

/// `mqtt://host:port` → `(host, port)`.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), SessionError> {
    let rest = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .ok_or_else(|| SessionError::Config(format!("Broker URL must be mqtt://host:port, got {}", url)))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| SessionError::Config(format!("Broker URL missing port: {}", url)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| SessionError::Config(format!("Broker port invalid: {}", url)))?;
    if host.is_empty() {
        return Err(SessionError::Config(format!("Broker host missing: {}", url)));
    }
    Ok((host.to_string(), port))
}

/// Connect and subscribe a hub broker session. The access token doubles
/// as the MQTT username.
pub(super) async fn connect_hub(
    connector: &Connector,
    cfg: &HubConfig,
    credentials: &CredentialStore,
) -> Result<Transport, SessionError> {
    let token = credentials.fresh_hub_token(&connector.id).await?;
    // Re-read: the refresh may have just discovered the account id.
    let (_, cfg) = match credentials.hub_config(&connector.id) {
        Ok(fresh) => fresh,
        Err(_) => (connector.clone(), cfg.clone()),
    };
    let topic = cfg
        .report_topic_filter()
        .ok_or_else(|| SessionError::Config("Hub account id not yet known".into()))?;

    let (host, port) = parse_broker_url(&cfg.broker_url)?;
    let mut options = MqttOptions::new(format!("fusion-{}", connector.id), host, port);
    options.set_credentials(token, "");
    options.set_keep_alive(KEEPALIVE);
    options.set_clean_session(true);
    let (client, mut eventloop) = AsyncClient::new(options, 16);

    let mut pending = VecDeque::new();

    // Drive the event loop until the broker acknowledges the connection.
    tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == rumqttc::ConnectReturnCode::Success {
                        return Ok(());
                    }
                    return Err(SessionError::AuthRejected(format!(
                        "Broker refused connection: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => continue,
                Err(e) => return Err(classify_mqtt_error(e)),
            }
        }
    })
    .await
    .map_err(|_| SessionError::Timeout("connecting to broker"))??;

    client
        .subscribe(topic.as_str(), QoS::AtLeastOnce)
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;

    tokio::time::timeout(SUBSCRIBE_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(_))) => return Ok(()),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    pending.push_back(RawFrame::Mqtt {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(_) => continue,
                Err(e) => return Err(classify_mqtt_error(e)),
            }
        }
    })
    .await
    .map_err(|_| SessionError::Timeout("subscribing to report topic"))??;

    debug!(%topic, "Hub session subscribed");
    Ok(Transport::Mqtt { client, eventloop, pending })
}

fn classify_mqtt_error(e: rumqttc::ConnectionError) -> SessionError {
    match e {
        rumqttc::ConnectionError::ConnectionRefused(code) => {
            SessionError::AuthRejected(format!("Broker refused connection: {:?}", code))
        }
        other => SessionError::Transport(other.to_string()),
    }
}

/// Connect the VMS event stream. The stream carries events immediately;
/// there is no separate subscribe step.
pub(super) async fn connect_vms(cfg: &VmsConfig) -> Result<Transport, SessionError> {
    let url = format!("{}?auth={}", cfg.event_stream_url(), cfg.api_token);
    let (stream, response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| SessionError::Timeout("connecting to event stream"))?
        .map_err(|e| match &e {
            tokio_tungstenite::tungstenite::Error::Http(response)
                if response.status() == 401 || response.status() == 403 =>
            {
                SessionError::AuthRejected(format!("Event stream returned {}", response.status()))
            }
            other => SessionError::Transport(other.to_string()),
        })?;
    debug!(status = %response.status(), "VMS event stream connected");
    Ok(Transport::Ws(stream))
}
