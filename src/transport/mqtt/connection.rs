//! Pure construction of rumqttc options from a [`ConnectionConfig`]

use super::signing::presign_url;
use crate::transport::{ConnectionConfig, Protocol, TransportError};
use chrono::Utc;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;

/// Largest packet accepted from the broker
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Capacity of the request channel between client and event loop
pub const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Check the parts of a config rumqttc would otherwise panic on
pub fn validate_config(config: &ConnectionConfig) -> Result<(), TransportError> {
    let host = config.host.trim();
    if host.is_empty() {
        return Err(TransportError::InvalidEndpoint(
            "broker host is empty".to_string(),
        ));
    }
    if host.contains("://") || host.contains('/') {
        return Err(TransportError::InvalidEndpoint(format!(
            "expected a bare host name, got {host}"
        )));
    }
    if config.client_id.trim().is_empty() || config.client_id.starts_with(' ') {
        return Err(TransportError::Construction(
            "client id must not be empty".to_string(),
        ));
    }
    if config.port == 0 {
        return Err(TransportError::InvalidEndpoint("port must not be 0".to_string()));
    }
    Ok(())
}

/// Build MQTT options for one connection attempt
///
/// Websocket connections get a freshly presigned URL each time, so a
/// reconnect always signs with the newest credential.
pub fn configure_mqtt_options(config: &ConnectionConfig) -> Result<MqttOptions, TransportError> {
    validate_config(config)?;
    let host = config.host.trim();

    let mut mqtt_options = match config.protocol {
        Protocol::Wss => {
            let url = presign_url(host, config.port, &config.region, &config.credential, Utc::now())?;
            let mut options = MqttOptions::new(&config.client_id, url, config.port);
            options.set_transport(RumqttcTransport::wss_with_default_config());
            options
        }
        Protocol::Mqtts => {
            let mut options = MqttOptions::new(&config.client_id, host, config.port);
            options.set_transport(RumqttcTransport::tls_with_default_config());
            options
        }
        Protocol::Mqtt => MqttOptions::new(&config.client_id, host, config.port),
    };

    mqtt_options.set_keep_alive(config.keep_alive);
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    Ok(mqtt_options)
}
