//! High-level modem handle.
//!
//! [`SimModem`] owns the transport and takes turns between the two consumers
//! of its bytes: the [`Correlator`] while a command runs, and the
//! [`Dispatcher`] on each [`SimModem::service`] tick. Because both need
//! `&mut self`, they can never read the port at the same time.
//!
//! The call/SMS/data/HTTP/USSD methods only format command strings and pick a
//! timeout; every one of them blocks for its full window.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::{CancelSignal, Clock, MonotonicClock};
use crate::config::{Config, TimeoutConfig};
use crate::correlator::Correlator;
use crate::dispatch::{Dispatcher, ModemEvents};
use crate::parse;
use crate::transport::{Echo, SerialTransport, Transport};
use crate::ussd::{is_valid_mmi, INVALID_MMI};

/// Terminates SMS text input.
const CTRL_Z: u8 = 0x1A;

const DEFAULT_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Reply window per command class.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub command: Duration,
    pub call: Duration,
    pub data: Duration,
    pub http: Duration,
    pub body: Duration,
    pub ussd: Duration,
    pub prompt: Duration,
    pub sms_read: Duration,
}

impl From<&TimeoutConfig> for Timeouts {
    fn from(c: &TimeoutConfig) -> Self {
        Self {
            command: Duration::from_millis(c.command_ms),
            call: Duration::from_millis(c.call_ms),
            data: Duration::from_millis(c.data_ms),
            http: Duration::from_millis(c.http_ms),
            body: Duration::from_millis(c.body_ms),
            ussd: Duration::from_millis(c.ussd_ms),
            prompt: Duration::from_millis(c.prompt_ms),
            sms_read: Duration::from_millis(c.sms_read_ms),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

/// A cellular modem driven over AT commands.
pub struct SimModem<T: Transport> {
    port: T,
    echo: Echo,
    correlator: Correlator,
    dispatcher: Dispatcher,
    timeouts: Timeouts,
    default_apn: String,
    apn_configured: bool,
    /// Last `+HTTPACTION` status, `-1` if none yet or unparseable.
    http_status: i32,
}

impl SimModem<SerialTransport> {
    /// Open the configured serial device.
    pub fn open(config: &Config, cancel: Arc<dyn CancelSignal>) -> Result<Self, String> {
        let port = SerialTransport::open(&config.serial.device, config.serial.baud)?;
        let modem = Self::new(
            port,
            Arc::new(MonotonicClock::new()),
            cancel,
            Timeouts::from(&config.timeouts),
        )
        .with_default_apn(&config.data.default_apn);
        Ok(modem)
    }
}

impl<T: Transport> SimModem<T> {
    pub fn new(
        port: T,
        clock: Arc<dyn Clock>,
        cancel: Arc<dyn CancelSignal>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            port,
            echo: Echo::none(),
            correlator: Correlator::new(clock.clone(), cancel),
            dispatcher: Dispatcher::new(clock, timeouts.sms_read),
            timeouts,
            default_apn: "internet".to_string(),
            apn_configured: false,
            http_status: -1,
        }
    }

    /// Mirror every received byte to `echo`.
    #[must_use]
    pub fn with_echo(mut self, echo: Echo) -> Self {
        self.echo = echo;
        self
    }

    /// APN used by [`Self::start_data`] when none was set.
    #[must_use]
    pub fn with_default_apn(mut self, apn: &str) -> Self {
        self.default_apn = apn.to_string();
        self
    }

    /// Replace the call/SMS event handler.
    pub fn set_handler(&mut self, handler: impl ModemEvents + 'static) {
        self.dispatcher.set_handler(handler);
    }

    /// `Err` once the transport has failed for good.
    pub fn health(&self) -> Result<(), String> {
        self.port.health()
    }

    #[must_use]
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Probe the modem with a bare `AT`. True if it answered `OK`.
    pub fn begin(&mut self) -> bool {
        let ok = self.execute("AT", self.timeouts.command).contains("OK");
        if ok {
            info!("Modem answered AT");
        } else {
            warn!("Modem did not answer AT");
        }
        ok
    }

    /// Send `command` and return everything received within `timeout`.
    pub fn execute(&mut self, command: &str, timeout: Duration) -> String {
        self.correlator
            .execute(&mut self.port, &mut self.echo, command, timeout)
    }

    /// Like [`Self::execute`] but the reply is only echoed and logged.
    pub fn send(&mut self, command: &str, timeout: Duration) {
        self.execute(command, timeout);
    }

    /// One notification service tick. Never blocks.
    pub fn service(&mut self) {
        self.dispatcher.service(&mut self.port, &mut self.echo);
    }

    /// Release the transport.
    pub fn into_transport(self) -> T {
        self.port
    }

    /// `command` window followed by a drain window; both replies concatenated.
    fn exchange(&mut self, command: &str, first: Duration, follow: Duration) -> String {
        let mut reply = self.execute(command, first);
        reply.push_str(&self.execute("", follow));
        reply
    }

    /// Raw payload after an input prompt (SMS text, HTTP body).
    fn write_raw(&mut self, bytes: &[u8]) {
        if let Err(e) = self.port.write(bytes) {
            warn!("payload write ({} bytes): {e}", bytes.len());
        }
    }

    // ── Call / SMS ───────────────────────────────────────────────────

    pub fn make_call(&mut self, number: &str) -> String {
        self.execute(&format!("ATD{number};"), self.timeouts.call)
    }

    pub fn answer_call(&mut self) -> String {
        self.execute("ATA", self.timeouts.call)
    }

    pub fn hang_up(&mut self) -> String {
        self.execute("ATH", self.timeouts.call)
    }

    /// Enable `+CLIP:` caller ID notifications.
    pub fn enable_caller_id(&mut self) -> String {
        self.execute("AT+CLIP=1", self.timeouts.command)
    }

    /// Submit a text-mode SMS. Returns the reply to the body submission.
    pub fn send_sms(&mut self, number: &str, message: &str) -> String {
        self.send("AT+CMGF=1", self.timeouts.command);
        self.send(&format!("AT+CMGS=\"{number}\""), self.timeouts.prompt);
        let mut payload = Vec::with_capacity(message.len() + 1);
        payload.extend_from_slice(message.as_bytes());
        payload.push(CTRL_Z);
        self.write_raw(&payload);
        self.execute("", self.timeouts.body)
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Raw `AT+CSQ` reply.
    pub fn signal_strength(&mut self) -> String {
        self.execute("AT+CSQ", self.timeouts.command)
    }

    /// RSSI in dBm from `AT+CSQ`.
    pub fn signal_dbm(&mut self) -> Result<i32, String> {
        parse::parse_csq(&self.signal_strength())
    }

    /// Raw `AT+COPS?` reply.
    pub fn operator(&mut self) -> String {
        self.execute("AT+COPS?", self.timeouts.command)
    }

    /// Registered operator name from `AT+COPS?`.
    pub fn operator_name(&mut self) -> Option<String> {
        parse::parse_cops(&self.operator())
    }

    /// Raw `AT+CSCA?` reply (SMS service centre).
    pub fn smsc(&mut self) -> String {
        self.execute("AT+CSCA?", self.timeouts.command)
    }

    pub fn set_smsc(&mut self, smsc: &str) -> String {
        self.execute(&format!("AT+CSCA=\"{smsc}\""), self.timeouts.command)
    }

    // ── Packet data ──────────────────────────────────────────────────

    /// Define PDP context 1 with `apn`.
    pub fn setup_apn(&mut self, apn: &str) -> String {
        self.apn_configured = true;
        self.execute(
            &format!("AT+CGDCONT=1,\"IP\",\"{apn}\""),
            self.timeouts.command,
        )
    }

    /// Open the data session, configuring the default APN first if needed.
    /// True if the reply contains `OK`.
    pub fn start_data(&mut self) -> bool {
        if !self.apn_configured {
            let apn = self.default_apn.clone();
            info!("No APN configured, using default {apn:?}");
            self.setup_apn(&apn);
        }
        let reply = self.exchange("AT+NETOPEN", self.timeouts.data, self.timeouts.data);
        reply.contains("OK")
    }

    pub fn stop_data(&mut self) -> String {
        self.apn_configured = false;
        self.execute("AT+NETCLOSE", self.timeouts.data)
    }

    pub fn ip_address(&mut self) -> String {
        self.execute("AT+IPADDR", self.timeouts.data)
    }

    // ── HTTP ─────────────────────────────────────────────────────────

    /// GET `url`; returns the `AT+HTTPREAD` reply. See [`Self::http_status`].
    pub fn http_get(&mut self, url: &str) -> String {
        self.send("AT+HTTPINIT", self.timeouts.command);
        self.send(&format!("AT+HTTPPARA=\"URL\",\"{url}\""), self.timeouts.command);
        self.http_action(0)
    }

    /// POST `data` to `url`; returns the `AT+HTTPREAD` reply.
    /// `content_type` defaults to `application/x-www-form-urlencoded`.
    pub fn http_post(&mut self, url: &str, data: &str, content_type: Option<&str>) -> String {
        let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE);
        self.send("AT+HTTPINIT", self.timeouts.command);
        self.send(&format!("AT+HTTPPARA=\"URL\",\"{url}\""), self.timeouts.command);
        self.send(
            &format!("AT+HTTPPARA=\"CONTENT\",\"{content_type}\""),
            self.timeouts.command,
        );
        self.send(&format!("AT+HTTPDATA={},5000", data.len()), self.timeouts.command);
        self.send("", self.timeouts.prompt);
        self.write_raw(data.as_bytes());
        self.send("", self.timeouts.body);
        self.http_action(1)
    }

    /// Status of the last HTTP action, `-1` if none or unparseable.
    #[must_use]
    pub fn http_status(&self) -> i32 {
        self.http_status
    }

    fn http_action(&mut self, method: u8) -> String {
        let reply = self.exchange(
            &format!("AT+HTTPACTION={method}"),
            self.timeouts.http,
            self.timeouts.http,
        );
        self.http_status = parse::http_status(&reply);
        info!("HTTPACTION={method}: status {}", self.http_status);
        self.execute("AT+HTTPREAD", self.timeouts.http)
    }

    // ── USSD ─────────────────────────────────────────────────────────

    /// Send a USSD code without validation; returns the network reply window.
    pub fn send_ussd(&mut self, code: &str) -> String {
        self.exchange(
            &format!("AT+CUSD=1,\"{code}\",15"),
            self.timeouts.command,
            self.timeouts.ussd,
        )
    }

    /// Validate `code` first; an invalid code is never transmitted.
    pub fn send_ussd_checked(&mut self, code: &str) -> String {
        if is_valid_mmi(code) {
            info!("Valid MMI code {code}, sending");
            self.send_ussd(code)
        } else {
            warn!("Invalid MMI code {code:?}");
            INVALID_MMI.to_string()
        }
    }
}
