//! Notification rendering
//!
//! Turns an emitted [`MessageGroup`] into Telegram HTML. Rendering is pure:
//! identities are resolved beforehand by the notifier and anything missing
//! simply drops out of the text.

use crate::correlation::{GatewayReceipt, MessageGroup};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write;
use teloxide::utils::html::escape;

/// Rendering options
#[derive(Debug, Clone, Default)]
pub struct FormatOptions {
    /// Bot username used for the sender deep link, without `@`
    pub bot_username: Option<String>,
}

/// Display names of a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeIdentity {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
}

impl NodeIdentity {
    fn display_name(&self) -> Option<&str> {
        self.long_name
            .as_deref()
            .or(self.short_name.as_deref())
            .filter(|name| !name.is_empty())
    }
}

/// Sender identity plus its latest device telemetry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderIdentity {
    pub identity: NodeIdentity,
    pub battery_level: Option<f64>,
    pub voltage: Option<f64>,
}

/// Print whole numbers without a fraction
fn number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn gateway_line(
    receipt: &GatewayReceipt,
    identity: Option<&NodeIdentity>,
    with_signal: bool,
) -> String {
    let id = receipt
        .gateway_id
        .as_deref()
        .unwrap_or(&receipt.gateway_key);
    let name = identity.and_then(NodeIdentity::display_name).unwrap_or(id);

    let mut line = format!("🛰️ <b>RX:</b> {} ({})", escape(name), escape(id));

    if let Some(hop) = receipt.hop_limit {
        let _ = write!(line, " Hop: {}", hop);
    }

    if with_signal {
        let _ = match (receipt.rx_rssi, receipt.rx_snr) {
            (Some(rssi), Some(snr)) => write!(line, " RSSI/SNR: {}/{}", rssi, snr),
            (Some(rssi), None) => write!(line, " RSSI: {}", rssi),
            (None, Some(snr)) => write!(line, " SNR: {}", snr),
            (None, None) => Ok(()),
        };
    }

    line
}

fn message_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render a consolidated message group
pub fn render_group(
    group: &MessageGroup,
    sender: &SenderIdentity,
    gateways: &HashMap<String, NodeIdentity>,
    options: &FormatOptions,
) -> String {
    let multi = group.gateways.len() > 1;
    let mut lines = Vec::with_capacity(group.gateways.len() + 4);

    for receipt in &group.gateways {
        let identity = gateways.get(&receipt.gateway_key);

        if !receipt.is_relay_only() {
            lines.push(gateway_line(receipt, identity, true));
        } else if multi {
            lines.push(format!("{} <b>MQTT</b>", gateway_line(receipt, identity, false)));
        } else {
            lines.push("<b>MQTT</b>".to_string());
        }
    }

    let hex = group.event.origin_id.hex();
    let id = match options.bot_username.as_deref().filter(|bot| !bot.is_empty()) {
        Some(bot) => format!(
            "<a href=\"https://t.me/{}?start={}\">{}</a>",
            escape(bot),
            hex.trim_start_matches('!'),
            hex
        ),
        None => hex,
    };
    match sender.identity.display_name() {
        Some(name) => lines.push(format!("📟 <b>From:</b> {} {}", escape(name), id)),
        None => lines.push(format!("📟 <b>From:</b> {}", id)),
    }

    if let Some(battery) = sender.battery_level.filter(|b| *b != 0.0) {
        lines.push(format!("🔋 <b>Battery:</b> {}%", number(battery)));
    }
    if let Some(voltage) = sender.voltage.filter(|v| *v != 0.0) {
        lines.push(format!("⚡ <b>Voltage:</b> {}V", number(voltage)));
    }

    lines.push(format!(
        "✉️ <b>Msg:</b> {}",
        escape(&message_text(&group.event.payload))
    ));

    lines.join("\n")
}
