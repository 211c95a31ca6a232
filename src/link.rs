use crate::config::{LinkConfig, StartCommand};
use crate::session::{SharedSession, Token, UnrecognizedToken};
use crate::timer::high_precision_sleep;
use log::{debug, error, info, warn};
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, BufRead, BufReader, Write};
use std::thread::{self, JoinHandle};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial link is not open")]
    NotOpen,
    #[error("failed to send command: {0}")]
    Write(#[source] io::Error),
    #[error("serial read failed: {0}")]
    Read(#[source] io::Error),
    #[error("serial link closed by the controller")]
    Closed,
}

/// One item pulled off the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Token(Token),
    Unrecognized(String),
    /// Read timed out or the line was blank; the controller is between tokens
    Idle,
}

impl Inbound {
    fn parse(line: &str) -> Self {
        if line.is_empty() {
            return Inbound::Idle;
        }
        match line.parse::<Token>() {
            Ok(token) => Inbound::Token(token),
            Err(UnrecognizedToken(line)) => Inbound::Unrecognized(line),
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Longest line kept while waiting for a newline. Anything longer is line noise.
pub const MAX_LINE_BYTES: usize = 256;

/// Lazy, non-restartable sequence of inbound lines.
///
/// Each call consumes at most one buffered chunk, so a stream of bytes without newlines
/// still yields [`Inbound::Idle`] between chunks. Bytes are decoded lossily so line noise
/// never becomes an error. A line cut short by a read timeout is kept and completed by the
/// next read, up to [`MAX_LINE_BYTES`]. After the first failure the stream is fused.
pub struct TokenStream<R> {
    reader: R,
    line: Vec<u8>,
    failed: bool,
}

impl<R: BufRead> TokenStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(64),
            failed: false,
        }
    }

    fn take_line(&mut self) -> Inbound {
        let text = String::from_utf8_lossy(&self.line);
        let inbound = Inbound::parse(text.trim());
        debug!("Controller: {}", text.trim());
        self.line.clear();
        inbound
    }

    fn take_overflow(&mut self) -> Inbound {
        let text = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        Inbound::Unrecognized(text)
    }
}

impl<R: BufRead> Iterator for TokenStream<R> {
    type Item = Result<Inbound, LinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let read = match self.reader.fill_buf() {
            Ok([]) => None,
            Ok(chunk) => match chunk.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.line.extend_from_slice(&chunk[..end]);
                    Some((end + 1, true))
                }
                None => {
                    self.line.extend_from_slice(chunk);
                    Some((chunk.len(), false))
                }
            },
            Err(e) if is_timeout(&e) => return Some(Ok(Inbound::Idle)),
            Err(e) => {
                self.failed = true;
                return Some(Err(LinkError::Read(e)));
            }
        };
        let Some((consumed, complete)) = read else {
            if self.line.is_empty() {
                self.failed = true;
                return Some(Err(LinkError::Closed));
            }
            // unterminated tail before end of stream
            return Some(Ok(self.take_line()));
        };
        self.reader.consume(consumed);

        if self.line.len() > MAX_LINE_BYTES {
            Some(Ok(self.take_overflow()))
        } else if complete {
            Some(Ok(self.take_line()))
        } else {
            Some(Ok(Inbound::Idle))
        }
    }
}

/// Write half of the link. Only ever carries the start command.
pub struct LinkWriter<W> {
    channel: Option<W>,
}

impl<W: Write> LinkWriter<W> {
    pub fn new(channel: W) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    pub fn send_start(&mut self, command: &StartCommand) -> Result<(), LinkError> {
        let channel = self.channel.as_mut().ok_or(LinkError::NotOpen)?;
        writeln!(channel, "{command}")
            .and_then(|_| channel.flush())
            .map_err(LinkError::Write)?;
        info!("→ Sent to controller: {command}");
        Ok(())
    }

    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            debug!("Link writer closed");
        }
    }
}

/// Read half of the link, translating lines into session transitions
pub struct LinkListener<R> {
    stream: TokenStream<R>,
}

impl<R: BufRead> LinkListener<R> {
    pub fn new(reader: R) -> Self {
        Self {
            stream: TokenStream::new(reader),
        }
    }

    /// Applies tokens in arrival order until the session terminates or the link fails.
    ///
    /// A read failure terminates the session before it is returned.
    pub fn run(mut self, session: &SharedSession) -> Result<(), LinkError> {
        while !session.should_terminate() {
            let Some(inbound) = self.stream.next() else {
                break;
            };
            match inbound {
                Ok(Inbound::Token(token)) => session.on_event(token),
                Ok(Inbound::Unrecognized(line)) => warn!("{}", UnrecognizedToken(line)),
                Ok(Inbound::Idle) => {}
                Err(e) => {
                    error!("Serial error: {e}");
                    session.on_link_failure();
                    return Err(e);
                }
            }
        }
        debug!("Link listener stopped");
        Ok(())
    }

    /// Blocks until the controller acknowledges with `DONE`. Returns the lines seen before it.
    pub fn wait_for_done(self) -> Result<Vec<Token>, LinkError> {
        let mut seen = Vec::new();
        for inbound in self.stream {
            match inbound? {
                Inbound::Token(Token::Done) => return Ok(seen),
                Inbound::Token(token) => {
                    info!("Controller: {token}");
                    seen.push(token);
                }
                Inbound::Unrecognized(line) => warn!("{}", UnrecognizedToken(line)),
                Inbound::Idle => {}
            }
        }
        Err(LinkError::Closed)
    }
}

impl<R: BufRead + Send + 'static> LinkListener<R> {
    pub fn spawn(self, session: SharedSession) -> io::Result<JoinHandle<Result<(), LinkError>>> {
        thread::Builder::new()
            .name("link-listener".into())
            .spawn(move || self.run(&session))
    }
}

pub type SerialWriter = LinkWriter<Box<dyn SerialPort>>;
pub type SerialListener = LinkListener<BufReader<Box<dyn SerialPort>>>;

pub struct SerialLink;

impl SerialLink {
    /// Opens the port, lets the controller finish booting, drops its boot noise and splits the
    /// port into its write and read halves.
    pub fn open(config: &LinkConfig) -> Result<(SerialWriter, SerialListener), LinkError> {
        let open_err = |source: serialport::Error| LinkError::Open {
            port: config.port.clone(),
            source,
        };

        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(config.read_timeout())
            .open()
            .map_err(open_err)?;

        high_precision_sleep(config.settle());
        port.clear(ClearBuffer::Input).map_err(open_err)?;

        let writer = port.try_clone().map_err(open_err)?;
        info!(
            "✓ Connected to controller on {} at {} baud",
            config.port, config.baud_rate
        );

        Ok((LinkWriter::new(writer), LinkListener::new(BufReader::new(port))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DisplayState;
    use std::collections::VecDeque;
    use std::io::Read;

    /// Reader replaying a fixed script of chunks and errors
    struct Scripted(VecDeque<io::Result<&'static [u8]>>);

    impl Scripted {
        fn new(steps: impl IntoIterator<Item = io::Result<&'static [u8]>>) -> BufReader<Self> {
            BufReader::new(Self(steps.into_iter().collect()))
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    fn timeout() -> io::Result<&'static [u8]> {
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stream_types_lines_and_ignores_noise() {
        let reader = Scripted::new([Ok(&b"GRATING_ON\r\n  BLACK_SCREEN \nhello\n\n"[..])]);
        let items: Vec<_> = TokenStream::new(reader).collect();

        assert_eq!(items.len(), 5);
        assert_eq!(
            items[0].as_ref().unwrap(),
            &Inbound::Token(Token::GratingOn)
        );
        assert_eq!(
            items[1].as_ref().unwrap(),
            &Inbound::Token(Token::BlackScreen)
        );
        assert_eq!(
            items[2].as_ref().unwrap(),
            &Inbound::Unrecognized("hello".into())
        );
        assert_eq!(items[3].as_ref().unwrap(), &Inbound::Idle);
        assert!(matches!(items[4], Err(LinkError::Closed)));
    }

    #[test]
    fn partial_line_survives_timeout() {
        let reader = Scripted::new([Ok(&b"TRIAL"[..]), timeout(), Ok(&b"_END\n"[..])]);
        let mut stream = TokenStream::new(reader);

        assert_eq!(stream.next().unwrap().unwrap(), Inbound::Idle);
        assert_eq!(stream.next().unwrap().unwrap(), Inbound::Idle);
        assert_eq!(
            stream.next().unwrap().unwrap(),
            Inbound::Token(Token::TrialEnd)
        );
    }

    #[test]
    fn newline_free_noise_stays_idle_and_is_capped() {
        let noise: &'static [u8] = &[0u8; 100];
        let reader = Scripted::new([Ok(noise), Ok(noise), Ok(noise), Ok(&b"EXIT\n"[..])]);
        let mut stream = TokenStream::new(reader);

        assert_eq!(stream.next().unwrap().unwrap(), Inbound::Idle);
        assert_eq!(stream.next().unwrap().unwrap(), Inbound::Idle);
        match stream.next().unwrap().unwrap() {
            Inbound::Unrecognized(text) => assert_eq!(text.len(), 300),
            other => panic!("expected oversized line, got {other:?}"),
        }
        assert_eq!(stream.next().unwrap().unwrap(), Inbound::Token(Token::Exit));
    }

    #[test]
    fn boot_garbage_is_not_an_error() {
        let reader = Scripted::new([Ok(&b"\xff\xfe??\nEXIT\n"[..])]);
        let mut stream = TokenStream::new(reader);

        assert!(matches!(
            stream.next(),
            Some(Ok(Inbound::Unrecognized(_)))
        ));
        assert_eq!(stream.next().unwrap().unwrap(), Inbound::Token(Token::Exit));
    }

    #[test]
    fn read_failure_fuses_the_stream() {
        let reader = Scripted::new([
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
            Ok(&b"GRATING_ON\n"[..]),
        ]);
        let mut stream = TokenStream::new(reader);

        assert!(matches!(stream.next(), Some(Err(LinkError::Read(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn listener_applies_tokens_then_fails_on_close() {
        let session = SharedSession::new();
        session.on_trial_start_requested(|| Ok(())).unwrap();

        let reader = Scripted::new([
            Ok(&b"GRATING_ON\n"[..]),
            timeout(),
            Ok(&b"GRATING_OFF\nBLACK_SCREEN\n"[..]),
        ]);
        let result = LinkListener::new(reader).run(&session);

        assert!(matches!(result, Err(LinkError::Closed)));
        let state = session.snapshot();
        assert_eq!(state.display, DisplayState::Black);
        assert!(state.should_terminate);
        assert!(!state.trial_active);
    }

    #[test]
    fn listener_stops_reading_after_exit() {
        let session = SharedSession::new();
        let reader = Scripted::new([Ok(&b"EXIT\n"[..]), Ok(&b"GRATING_ON\n"[..])]);

        LinkListener::new(reader).run(&session).unwrap();
        let state = session.snapshot();
        assert!(state.should_terminate);
        assert_eq!(state.display, DisplayState::Gray);
    }

    #[test]
    fn listener_returns_at_once_when_already_cancelled() {
        let session = SharedSession::new();
        session.on_local_cancel();
        let reader = Scripted::new([Ok(&b"GRATING_ON\n"[..])]);

        LinkListener::new(reader).run(&session).unwrap();
        assert_eq!(session.snapshot().display, DisplayState::Gray);
    }

    #[test]
    fn wait_for_done_collects_tokens() {
        let reader = Scripted::new([
            Ok(&b"GRATING_ON\n"[..]),
            timeout(),
            Ok(&b"noise\nTRIAL_END\nDONE\nEXIT\n"[..]),
        ]);
        let seen = LinkListener::new(reader).wait_for_done().unwrap();
        assert_eq!(seen, vec![Token::GratingOn, Token::TrialEnd]);
    }

    #[test]
    fn wait_for_done_reports_dropped_link() {
        let reader = Scripted::new([Ok(&b"GRATING_ON\n"[..])]);
        assert!(matches!(
            LinkListener::new(reader).wait_for_done(),
            Err(LinkError::Closed)
        ));
    }

    #[test]
    fn start_command_is_newline_terminated() {
        let mut writer = LinkWriter::new(Vec::new());
        writer.send_start(&StartCommand::default()).unwrap();

        assert_eq!(
            writer.channel.as_deref(),
            Some(&b"START 30 7 0.1 0.2 1024 128\n"[..])
        );
    }

    #[test]
    fn closed_writer_reports_not_open() {
        let mut writer = LinkWriter::new(Vec::new());
        writer.close();
        assert!(!writer.is_open());
        assert!(matches!(
            writer.send_start(&StartCommand::default()),
            Err(LinkError::NotOpen)
        ));
    }

    #[test]
    fn write_failure_is_surfaced() {
        let mut writer = LinkWriter::new(BrokenPipe);
        assert!(matches!(
            writer.send_start(&StartCommand::default()),
            Err(LinkError::Write(_))
        ));
        assert!(writer.is_open());
    }
}
