//! Broker option construction

use crate::error::TransportError;
use crate::session::SessionOptions;
use rumqttc::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use url::Url;
use uuid::Uuid;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Build rumqttc options for one connection
///
/// The password is always empty: the platform authenticates devices by the
/// username alone, which is either the access token or `provision`.
pub fn configure_mqtt_options(options: &SessionOptions) -> Result<MqttOptions, TransportError> {
    let url = Url::parse(&options.broker_url)
        .map_err(|_| TransportError::InvalidBrokerUrl(options.broker_url.clone()))?;

    let tls = match url.scheme() {
        "mqtt" => false,
        "mqtts" => true,
        _ => return Err(TransportError::InvalidBrokerUrl(options.broker_url.clone())),
    };
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(options.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

    let mut mqtt_options = MqttOptions::new(build_client_id(&options.client_name), host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    mqtt_options.set_credentials(options.username.clone(), "");
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(true);

    Ok(mqtt_options)
}

/// Unique per connection so a restart never collides with the old session
fn build_client_id(client_name: &str) -> String {
    let name = client_name.trim();
    let name = if name.is_empty() { "tb-device" } else { name };
    format!("{name}-{}", Uuid::new_v4().simple())
}
