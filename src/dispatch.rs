//! Unsolicited notification dispatch.
//!
//! [`Dispatcher::service`] is called on every service tick while no command is
//! in flight. It drains the transport without blocking, assembles lines, and
//! routes the few unsolicited notifications we care about:
//!
//! | Line       | Action                                                     |
//! |------------|------------------------------------------------------------|
//! | `RING`     | nothing; the caller ID follows on `+CLIP:`                 |
//! | `+CLIP:`   | `on_call(<first quoted field>)`                            |
//! | `+CMTI:`   | queue `AT+CMGR=<index>` to fetch the new message           |
//! | `+CMGR:`   | take the sender, read the next raw line as the body, `on_sms` |
//!
//! Anything else is logged and dropped. Malformed notifications are dropped
//! after a `warn!`; nothing here can stop the service loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::correlator::LINE_TERMINATOR;
use crate::line::LineAssembler;
use crate::parse::{message_index, quoted_field};
use crate::transport::{Echo, Transport};

/// A classified line. Extraction failures are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification<'a> {
    Ring,
    /// `+CLIP:` with the caller ID.
    CallerId(Option<&'a str>),
    /// `+CMTI:` with the storage index of the new message.
    NewMessage(Option<u32>),
    /// `+CMGR:` header with the sender; the body is on the next line.
    MessageHeader(Option<&'a str>),
    Other,
}

/// Classify a trimmed line. Matching is case-sensitive.
#[must_use]
pub fn classify(line: &str) -> Notification<'_> {
    if line == "RING" {
        Notification::Ring
    } else if line.starts_with("+CLIP:") {
        Notification::CallerId(quoted_field(line, 0))
    } else if line.starts_with("+CMTI:") {
        Notification::NewMessage(message_index(line))
    } else if line.starts_with("+CMGR:") {
        // +CMGR: "REC UNREAD","+15550001111",,"23/06/29,12:34:56+32"
        Notification::MessageHeader(quoted_field(line, 1))
    } else {
        Notification::Other
    }
}

/// Receiver for call and SMS events.
///
/// Invoked synchronously from [`Dispatcher::service`]; implementations must not
/// block or touch the modem.
pub trait ModemEvents: Send {
    fn on_call(&mut self, _caller_id: &str) {}

    fn on_sms(&mut self, _sender: &str, _body: &str) {}
}

type CallFn = Box<dyn FnMut(&str) + Send>;
type SmsFn = Box<dyn FnMut(&str, &str) + Send>;

/// Closure-backed [`ModemEvents`] with one optional slot per event.
///
/// Setting a slot replaces whatever was there.
#[derive(Default)]
pub struct Callbacks {
    call: Option<CallFn>,
    sms: Option<SmsFn>,
}

impl Callbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_call(&mut self, f: impl FnMut(&str) + Send + 'static) {
        self.call = Some(Box::new(f));
    }

    pub fn set_sms(&mut self, f: impl FnMut(&str, &str) + Send + 'static) {
        self.sms = Some(Box::new(f));
    }

    #[must_use]
    pub fn with_call(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.set_call(f);
        self
    }

    #[must_use]
    pub fn with_sms(mut self, f: impl FnMut(&str, &str) + Send + 'static) -> Self {
        self.set_sms(f);
        self
    }
}

impl ModemEvents for Callbacks {
    fn on_call(&mut self, caller_id: &str) {
        if let Some(f) = self.call.as_mut() {
            f(caller_id);
        }
    }

    fn on_sms(&mut self, sender: &str, body: &str) {
        if let Some(f) = self.sms.as_mut() {
            f(sender, body);
        }
    }
}

/// Carry-over between lines. At most one partial notification is in progress.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum NotificationState {
    #[default]
    Idle,
    /// A `+CMGR:` header was seen; raw bytes up to the next `\n` are the body.
    AwaitingBody {
        index: Option<u32>,
        sender: Option<String>,
        body: Vec<u8>,
    },
}

/// A message fetch triggered by `+CMTI:`.
#[derive(Debug)]
struct PendingRead {
    index: u32,
    /// Set once `AT+CMGR=<index>` has been written.
    requested_at: Option<Duration>,
}

/// Drives unsolicited notifications to a [`ModemEvents`] handler.
///
/// Message fetches are queued by index; only the head of the queue has an
/// `AT+CMGR` outstanding, so each `+CMGR:` reply pairs with the head. A head
/// that gets no reply within the read timeout is dropped and the next is sent.
pub struct Dispatcher {
    assembler: LineAssembler,
    state: NotificationState,
    reads: VecDeque<PendingRead>,
    handler: Box<dyn ModemEvents>,
    clock: Arc<dyn Clock>,
    read_timeout: Duration,
}

impl Dispatcher {
    pub fn new(clock: Arc<dyn Clock>, read_timeout: Duration) -> Self {
        Self {
            assembler: LineAssembler::new(),
            state: NotificationState::Idle,
            reads: VecDeque::new(),
            handler: Box::new(Callbacks::default()),
            clock,
            read_timeout,
        }
    }

    /// Replace the event handler. The previous one is dropped immediately.
    pub fn set_handler(&mut self, handler: impl ModemEvents + 'static) {
        self.handler = Box::new(handler);
    }

    #[must_use]
    pub fn state(&self) -> &NotificationState {
        &self.state
    }

    /// Message indices waiting to be fetched, head first.
    pub fn pending_reads(&self) -> impl Iterator<Item = u32> + '_ {
        self.reads.iter().map(|r| r.index)
    }

    /// One non-blocking service tick.
    pub fn service<T: Transport>(&mut self, port: &mut T, echo: &mut Echo) {
        self.expire_reads(port);

        while port.byte_available() {
            let Some(b) = port.read_byte() else {
                break;
            };
            echo.byte(b);

            if matches!(self.state, NotificationState::AwaitingBody { .. }) {
                self.body_byte(port, b);
            } else if let Some(line) = self.assembler.feed(b) {
                self.handle_line(port, &line);
            }
        }
    }

    fn handle_line<T: Transport>(&mut self, port: &mut T, line: &str) {
        match classify(line) {
            Notification::Ring => debug!("RING"),
            Notification::CallerId(Some(caller)) => {
                info!("Incoming call from {caller:?}");
                self.handler.on_call(caller);
            }
            Notification::CallerId(None) => warn!("Malformed +CLIP, ignoring: {line}"),
            Notification::NewMessage(Some(index)) => self.queue_read(port, index),
            Notification::NewMessage(None) => warn!("Malformed +CMTI, ignoring: {line}"),
            Notification::MessageHeader(sender) => {
                let index = self.reads.pop_front().map(|r| r.index);
                if sender.is_none() {
                    warn!("Malformed +CMGR, body will be dropped: {line}");
                }
                self.state = NotificationState::AwaitingBody {
                    index,
                    sender: sender.map(str::to_string),
                    body: Vec::new(),
                };
            }
            Notification::Other => {
                if !line.is_empty() {
                    debug!("Received: {line}");
                }
            }
        }
    }

    fn body_byte<T: Transport>(&mut self, port: &mut T, b: u8) {
        if b != b'\n' {
            if let NotificationState::AwaitingBody { body, .. } = &mut self.state {
                body.push(b);
            }
            return;
        }

        let NotificationState::AwaitingBody {
            index,
            sender,
            body,
        } = std::mem::take(&mut self.state)
        else {
            return;
        };

        let body = String::from_utf8_lossy(&body);
        let body = body.strip_suffix('\r').unwrap_or(&body);

        match sender {
            Some(sender) => {
                info!("SMS {index:?} from {sender:?} ({} bytes)", body.len());
                self.handler.on_sms(&sender, body);
            }
            None => warn!("SMS {index:?} dropped: no sender"),
        }

        self.request_head(port);
    }

    fn queue_read<T: Transport>(&mut self, port: &mut T, index: u32) {
        if self.reads.iter().any(|r| r.index == index) {
            debug!("+CMTI {index} already queued");
            return;
        }
        self.reads.push_back(PendingRead {
            index,
            requested_at: None,
        });
        if self.state == NotificationState::Idle {
            self.request_head(port);
        }
    }

    /// Send `AT+CMGR` for the head of the queue unless already sent.
    fn request_head<T: Transport>(&mut self, port: &mut T) {
        let now = self.clock.now();
        let Some(head) = self.reads.front_mut() else {
            return;
        };
        if head.requested_at.is_some() {
            return;
        }
        let command = format!("AT+CMGR={}", head.index);
        debug!("AT > {command}");
        let mut line = command.into_bytes();
        line.extend_from_slice(LINE_TERMINATOR);
        if let Err(e) = port.write(&line) {
            warn!("AT+CMGR={}: {e}", head.index);
        }
        head.requested_at = Some(now);
    }

    fn expire_reads<T: Transport>(&mut self, port: &mut T) {
        if self.state != NotificationState::Idle {
            return;
        }
        let now = self.clock.now();
        let expired = self.reads.front().is_some_and(|head| {
            head.requested_at
                .is_some_and(|at| now.saturating_sub(at) >= self.read_timeout)
        });
        if expired {
            if let Some(head) = self.reads.pop_front() {
                warn!("AT+CMGR={} got no reply, giving up", head.index);
            }
            self.request_head(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::clock::FakeClock;
    use crate::transport::{MockTransport, SharedBuf};

    const READ_TIMEOUT: Duration = Duration::from_secs(10);

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Call(String),
        Sms(String, String),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Event>>>);

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ModemEvents for Recorder {
        fn on_call(&mut self, caller_id: &str) {
            self.0.lock().unwrap().push(Event::Call(caller_id.into()));
        }

        fn on_sms(&mut self, sender: &str, body: &str) {
            self.0
                .lock()
                .unwrap()
                .push(Event::Sms(sender.into(), body.into()));
        }
    }

    fn setup() -> (Dispatcher, Recorder, Arc<FakeClock>, MockTransport) {
        let clock = Arc::new(FakeClock::new(Duration::from_millis(10)));
        let mut d = Dispatcher::new(clock.clone(), READ_TIMEOUT);
        let rec = Recorder::default();
        d.set_handler(rec.clone());
        (d, rec, clock, MockTransport::new())
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("RING"), Notification::Ring);
        assert_eq!(classify("RINGING"), Notification::Other);
        assert_eq!(classify("ring"), Notification::Other);
        assert_eq!(
            classify("+CLIP: \"+15551234567\",129"),
            Notification::CallerId(Some("+15551234567"))
        );
        assert_eq!(classify("+clip: \"+1\",129"), Notification::Other);
        assert_eq!(classify("+CMTI: \"SM\",3"), Notification::NewMessage(Some(3)));
        assert_eq!(
            classify("+CMGR: \"REC UNREAD\",\"+15550001111\",,\"23/06/29,12:34:56+32\""),
            Notification::MessageHeader(Some("+15550001111"))
        );
        assert_eq!(classify("OK"), Notification::Other);
        assert_eq!(classify(""), Notification::Other);
    }

    #[test]
    fn test_service_echoes_every_byte() {
        let (mut d, rec, _, mut port) = setup();
        port.feed("RING\r\n+CMGR: \"REC UNREAD\",\"+15550001111\"\r\nhi\r\n");
        let buf = SharedBuf::default();
        let mut echo = Echo::to(buf.clone());
        d.service(&mut port, &mut echo);
        assert_eq!(
            buf.contents(),
            "RING\r\n+CMGR: \"REC UNREAD\",\"+15550001111\"\r\nhi\r\n"
        );
        assert_eq!(
            rec.events(),
            vec![Event::Sms("+15550001111".into(), "hi".into())]
        );
    }

    #[test]
    fn test_clip_invokes_call_handler() {
        let (mut d, rec, _, mut port) = setup();
        port.feed("\r\nRING\r\n\r\n+CLIP: \"+15551234567\",129\r\n");
        d.service(&mut port, &mut Echo::none());
        assert_eq!(rec.events(), vec![Event::Call("+15551234567".into())]);
    }

    #[test]
    fn test_clip_withheld_number_fires_empty() {
        let (mut d, rec, _, mut port) = setup();
        port.feed("+CLIP: \"\",128\r\n");
        d.service(&mut port, &mut Echo::none());
        assert_eq!(rec.events(), vec![Event::Call(String::new())]);
    }

    #[test]
    fn test_malformed_clip_suppressed() {
        let (mut d, rec, _, mut port) = setup();
        port.feed("+CLIP: 15551234567,129\r\n+CLIP: \"+1555\r\n");
        d.service(&mut port, &mut Echo::none());
        assert!(rec.events().is_empty());
    }

    #[test]
    fn test_cmgr_reads_body_line() {
        let (mut d, rec, _, mut port) = setup();
        port.feed("+CMGR: \"REC UNREAD\",\"+15550001111\",,\"23/06/29,12:34:56+32\"\r\nHello world\r\n\r\nOK\r\n");
        d.service(&mut port, &mut Echo::none());
        assert_eq!(
            rec.events(),
            vec![Event::Sms("+15550001111".into(), "Hello world".into())]
        );
        assert_eq!(*d.state(), NotificationState::Idle);
    }

    #[test]
    fn test_cmgr_body_straddles_ticks() {
        let (mut d, rec, _, mut port) = setup();
        let mut echo = Echo::none();
        port.feed("+CMGR: \"REC UNREAD\",\"+15550001111\",,\"23/06/29,12:34:56+32\"\r\nHel");
        d.service(&mut port, &mut echo);
        assert!(rec.events().is_empty());
        assert!(matches!(
            d.state(),
            NotificationState::AwaitingBody { sender: Some(s), .. } if s == "+15550001111"
        ));

        port.feed("lo, RING me\r\n");
        d.service(&mut port, &mut echo);
        assert_eq!(
            rec.events(),
            vec![Event::Sms("+15550001111".into(), "Hello, RING me".into())]
        );
    }

    #[test]
    fn test_cmgr_body_is_not_classified() {
        let (mut d, rec, _, mut port) = setup();
        port.feed("+CMGR: \"REC READ\",\"+1\",,\"x\"\r\n+CLIP: \"+2\",129\r\n");
        d.service(&mut port, &mut Echo::none());
        assert_eq!(
            rec.events(),
            vec![Event::Sms("+1".into(), "+CLIP: \"+2\",129".into())]
        );
    }

    #[test]
    fn test_cmgr_without_sender_drops_sms() {
        let (mut d, rec, _, mut port) = setup();
        port.feed("+CMGR: garbage\r\nbody text\r\n+CLIP: \"+3\",129\r\n");
        d.service(&mut port, &mut Echo::none());
        assert_eq!(rec.events(), vec![Event::Call("+3".into())]);
    }

    #[test]
    fn test_cmti_fetches_message() {
        let (mut d, rec, _, mut port) = setup();
        port.feed("+CMTI: \"SM\",3\r\n");
        d.service(&mut port, &mut Echo::none());
        assert_eq!(port.written_str(), "AT+CMGR=3\r\n");
        assert_eq!(d.pending_reads().collect::<Vec<_>>(), vec![3]);

        port.feed("+CMGR: \"REC UNREAD\",\"+15550001111\",,\"23/06/29,12:34:56+32\"\r\nHi\r\nOK\r\n");
        d.service(&mut port, &mut Echo::none());
        assert_eq!(rec.events(), vec![Event::Sms("+15550001111".into(), "Hi".into())]);
        assert_eq!(d.pending_reads().count(), 0);
    }

    #[test]
    fn test_second_cmti_waits_for_first() {
        let (mut d, rec, _, mut port) = setup();
        let mut echo = Echo::none();
        port.feed("+CMTI: \"SM\",1\r\n+CMTI: \"SM\",2\r\n+CMTI: \"SM\",2\r\n");
        d.service(&mut port, &mut echo);
        assert_eq!(port.written_str(), "AT+CMGR=1\r\n");
        assert_eq!(d.pending_reads().collect::<Vec<_>>(), vec![1, 2]);

        port.feed("+CMGR: \"REC UNREAD\",\"+1\",,\"t\"\r\nfirst\r\nOK\r\n");
        d.service(&mut port, &mut echo);
        assert_eq!(port.written_str(), "AT+CMGR=1\r\nAT+CMGR=2\r\n");

        port.feed("+CMGR: \"REC UNREAD\",\"+2\",,\"t\"\r\nsecond\r\nOK\r\n");
        d.service(&mut port, &mut echo);
        assert_eq!(
            rec.events(),
            vec![
                Event::Sms("+1".into(), "first".into()),
                Event::Sms("+2".into(), "second".into()),
            ]
        );
        assert_eq!(d.pending_reads().count(), 0);
    }

    #[test]
    fn test_unanswered_read_expires() {
        let (mut d, _, clock, mut port) = setup();
        let mut echo = Echo::none();
        port.feed("+CMTI: \"SM\",7\r\n+CMTI: \"SM\",8\r\n");
        d.service(&mut port, &mut echo);
        assert_eq!(port.written_str(), "AT+CMGR=7\r\n");

        clock.advance(READ_TIMEOUT - Duration::from_millis(1));
        d.service(&mut port, &mut echo);
        assert_eq!(d.pending_reads().collect::<Vec<_>>(), vec![7, 8]);

        clock.advance(Duration::from_millis(1));
        d.service(&mut port, &mut echo);
        assert_eq!(d.pending_reads().collect::<Vec<_>>(), vec![8]);
        assert_eq!(port.written_str(), "AT+CMGR=7\r\nAT+CMGR=8\r\n");
    }

    #[test]
    fn test_malformed_cmti_dropped() {
        let (mut d, rec, _, mut port) = setup();
        port.feed("+CMTI: \"SM\"\r\n+CLIP: \"+4\",129\r\n");
        d.service(&mut port, &mut Echo::none());
        assert!(port.written.is_empty());
        assert_eq!(rec.events(), vec![Event::Call("+4".into())]);
    }

    #[test]
    fn test_line_split_across_ticks() {
        let (mut d, rec, _, mut port) = setup();
        let mut echo = Echo::none();
        port.feed("+CLIP: \"+1555");
        d.service(&mut port, &mut echo);
        assert!(rec.events().is_empty());
        port.feed("1234567\",129\r\n");
        d.service(&mut port, &mut echo);
        assert_eq!(rec.events(), vec![Event::Call("+15551234567".into())]);
    }

    #[test]
    fn test_set_handler_replaces_previous() {
        let (mut d, first, _, mut port) = setup();
        let second = Recorder::default();
        d.set_handler(second.clone());
        port.feed("+CLIP: \"+5\",129\r\n");
        d.service(&mut port, &mut Echo::none());
        assert!(first.events().is_empty());
        assert_eq!(second.events(), vec![Event::Call("+5".into())]);
    }

    #[test]
    fn test_callbacks_slots() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sms = Arc::new(Mutex::new(Vec::new()));
        let (c, s) = (calls.clone(), sms.clone());
        let mut cb = Callbacks::new()
            .with_call(move |id| c.lock().unwrap().push(id.to_string()))
            .with_sms(move |from, body| s.lock().unwrap().push(format!("{from}:{body}")));
        cb.on_call("+1");
        cb.on_sms("+2", "hi");
        assert_eq!(*calls.lock().unwrap(), vec!["+1".to_string()]);
        assert_eq!(*sms.lock().unwrap(), vec!["+2:hi".to_string()]);

        let mut empty = Callbacks::new();
        empty.on_call("+1");
        empty.on_sms("+2", "ignored");
    }

    #[test]
    fn test_write_failure_does_not_stop_service() {
        let (mut d, rec, _, mut port) = setup();
        port.fail_writes = true;
        port.feed("+CMTI: \"SM\",1\r\n+CLIP: \"+6\",129\r\n");
        d.service(&mut port, &mut Echo::none());
        assert_eq!(rec.events(), vec![Event::Call("+6".into())]);
        assert_eq!(d.pending_reads().collect::<Vec<_>>(), vec![1]);
    }
}
