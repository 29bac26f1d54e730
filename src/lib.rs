#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! simlink: AT command driver for cellular modems over a serial link.
//!
//! - `transport`: byte channel trait, raw termios serial port, echo sink
//! - `clock`: injectable monotonic clock and cancel signal
//! - `line`: incremental line assembler
//! - `correlator`: send a command, collect its reply for a fixed window
//! - `dispatch`: unsolicited `RING` / `+CLIP` / `+CMTI` / `+CMGR` handling
//! - `parse`: substring extractors for reply text
//! - `ussd`: MMI code validation
//! - `modem`: `SimModem` facade with call/SMS/data/HTTP/USSD helpers
//! - `config`: configuration loading

pub mod clock;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod line;
pub mod modem;
pub mod parse;
pub mod transport;
pub mod ussd;

pub use clock::{CancelSignal, Clock, MonotonicClock, Never};
pub use config::Config;
pub use correlator::{Completion, Correlator, PendingCommand};
pub use dispatch::{Callbacks, Dispatcher, ModemEvents, Notification, NotificationState};
pub use line::LineAssembler;
pub use modem::{SimModem, Timeouts};
pub use transport::{Echo, SerialTransport, Transport};
