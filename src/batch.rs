use crate::config::{LinkConfig, StartCommand};
use crate::link::{LinkError, LinkListener, LinkWriter, SerialLink};
use crate::session::Token;
use log::info;
use std::io::{BufRead, Write};

/// Sends one start command and blocks until the controller answers `DONE`.
pub fn exchange<W: Write, R: BufRead>(
    writer: &mut LinkWriter<W>,
    listener: LinkListener<R>,
    start: &StartCommand,
) -> Result<Vec<Token>, LinkError> {
    writer.send_start(start)?;
    let seen = listener.wait_for_done()?;
    info!("Controller finished after {} tokens", seen.len());
    Ok(seen)
}

/// Non-interactive run over the serial port, no window involved
pub fn run_batch(link: &LinkConfig, start: &StartCommand) -> Result<Vec<Token>, LinkError> {
    let (mut writer, listener) = SerialLink::open(link)?;
    let result = exchange(&mut writer, listener, start);
    writer.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn exchange_sends_start_and_waits_for_done() {
        let mut writer = LinkWriter::new(Vec::new());
        let listener = LinkListener::new(Cursor::new(b"GRATING_ON\nBLACK_SCREEN\nDONE\n".to_vec()));

        let seen = exchange(&mut writer, listener, &StartCommand::default()).unwrap();
        assert_eq!(seen, vec![Token::GratingOn, Token::BlackScreen]);
    }

    #[test]
    fn exchange_skips_reading_when_send_fails() {
        let mut writer: LinkWriter<Vec<u8>> = LinkWriter::new(Vec::new());
        writer.close();
        let listener = LinkListener::new(Cursor::new(b"DONE\n".to_vec()));

        assert!(matches!(
            exchange(&mut writer, listener, &StartCommand::default()),
            Err(LinkError::NotOpen)
        ));
    }
}
