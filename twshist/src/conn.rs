// twshist/src/conn.rs

use crate::base::TwsError;
use crate::handler::GatewayHandler;
use std::sync::Arc;
pub use socket::{SocketConnection, SocketOptions};

/// Transport to the gateway. The session owns exactly one.
pub trait Connection: Send {
  fn is_connected(&self) -> bool;

  /// Close the transport. Calling it again is a no-op.
  fn disconnect(&mut self) -> Result<(), TwsError>;

  /// Send one message body; framing is added here.
  fn send_message_body(&mut self, data: &[u8]) -> Result<(), TwsError>;

  /// Install the handler and start delivering inbound messages to it.
  fn set_message_handler(&mut self, handler: Arc<dyn GatewayHandler>);

  fn get_server_version(&self) -> i32;

  /// Request id the recorded session started from, for transports that
  /// replay a recording.
  fn replay_first_request_id(&self) -> Option<i32> {
    None
  }
}

mod socket {
  use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
  use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
  use log::{debug, error, info, trace, warn};
  use std::io::{self, Cursor, ErrorKind, Read, Write};
  use std::net::{Shutdown, TcpStream, ToSocketAddrs};
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Arc;
  use std::thread;
  use std::time::{Duration, Instant};

  use super::Connection;
  use crate::base::TwsError;
  use crate::conn_log::{ConnectionLogger, LogDirection};
  use crate::handler::GatewayHandler;
  use crate::message_parser::{peek_message_type, process_message};
  use crate::min_server_ver::min_server_ver;
  use crate::protocol_encoder::{client_version_string, Encoder};

  const MAX_MSG_SIZE: usize = 10 * 1024 * 1024;
  const READER_POLL: Duration = Duration::from_secs(2);

  #[derive(Debug, Clone)]
  pub struct SocketOptions {
    pub connect_timeout: Duration,
    /// How long `disconnect` waits for the reader thread before detaching it.
    pub disconnect_grace: Duration,
  }

  impl Default for SocketOptions {
    fn default() -> Self {
      Self { connect_timeout: Duration::from_secs(10), disconnect_grace: Duration::from_secs(3) }
    }
  }

  enum Frame {
    Body(Vec<u8>),
    Idle,
  }

  // Reads until `buf` is full. A timeout before the first byte is
  // reported as WouldBlock so callers can poll; once a frame has started
  // it must complete within `timeout`.
  fn read_exact_timeout(stream: &mut TcpStream, buf: &mut [u8], timeout: Duration) -> io::Result<()> {
    let start = Instant::now();
    let mut bytes_read = 0;
    while bytes_read < buf.len() {
      match stream.read(&mut buf[bytes_read..]) {
        Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "connection closed by peer")),
        Ok(n) => bytes_read += n,
        Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
          if bytes_read == 0 {
            return Err(io::Error::new(ErrorKind::WouldBlock, "no data"));
          }
          if start.elapsed() > timeout {
            return Err(io::Error::new(ErrorKind::TimedOut, "frame stalled mid-read"));
          }
        }
        Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  fn read_frame(stream: &mut TcpStream, timeout: Duration) -> Result<Frame, TwsError> {
    let mut size_buf = [0u8; 4];
    match read_exact_timeout(stream, &mut size_buf, timeout) {
      Ok(()) => {}
      Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Frame::Idle),
      Err(e) => return Err(TwsError::SocketError(format!("Reading message size: {}", e))),
    }
    let size = Cursor::new(size_buf)
      .read_u32::<BigEndian>()
      .map_err(|e| TwsError::ParseError(format!("Parsing message size: {}", e)))? as usize;
    if size == 0 {
      return Ok(Frame::Body(Vec::new()));
    }
    if size > MAX_MSG_SIZE {
      return Err(TwsError::SocketError(format!("Message size too large: {}", size)));
    }
    let mut body = vec![0u8; size];
    // The length prefix arrived, so the body is owed: WouldBlock here is a stall.
    let start = Instant::now();
    loop {
      match read_exact_timeout(stream, &mut body, timeout) {
        Ok(()) => return Ok(Frame::Body(body)),
        Err(e) if e.kind() == ErrorKind::WouldBlock && start.elapsed() < timeout => continue,
        Err(e) => return Err(TwsError::SocketError(format!("Reading message body ({} bytes): {}", size, e))),
      }
    }
  }

  fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<(), TwsError> {
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame
      .write_u32::<BigEndian>(body.len() as u32)
      .map_err(|e| TwsError::InternalError(format!("Failed to encode length: {}", e)))?;
    frame.extend_from_slice(body);
    stream.write_all(&frame).map_err(|e| TwsError::SocketError(e.to_string()))?;
    stream.flush().map_err(|e| TwsError::SocketError(e.to_string()))
  }

  /// TCP transport. Owns the reader thread that dispatches every inbound
  /// message to the installed handler.
  pub struct SocketConnection {
    host: String,
    port: u16,
    client_id: i32,
    server_version: i32,
    connection_time: String,
    options: SocketOptions,
    stream: Option<TcpStream>,
    logger: Option<ConnectionLogger>,
    reader_thread: Option<thread::JoinHandle<()>>,
    reader_exit: Option<Receiver<()>>,
    stop_flag: Arc<AtomicBool>,
    reader_alive: Arc<AtomicBool>,
  }

  impl SocketConnection {
    /// Connect and run the handshake up to StartAPI. Inbound messages are
    /// not read until a handler is installed.
    pub fn connect(
      host: &str,
      port: u16,
      client_id: i32,
      options: SocketOptions,
      logger: Option<ConnectionLogger>,
    ) -> Result<Self, TwsError> {
      let mut conn = Self {
        host: host.to_string(),
        port,
        client_id,
        server_version: 0,
        connection_time: String::new(),
        options,
        stream: None,
        logger,
        reader_thread: None,
        reader_exit: None,
        stop_flag: Arc::new(AtomicBool::new(false)),
        reader_alive: Arc::new(AtomicBool::new(false)),
      };
      conn.handshake()?;
      Ok(conn)
    }

    pub fn connection_time(&self) -> &str {
      &self.connection_time
    }

    fn open_stream(&self) -> Result<TcpStream, TwsError> {
      let timeout = self.options.connect_timeout;
      let addrs: Vec<_> = (self.host.as_str(), self.port)
        .to_socket_addrs()
        .map_err(|e| TwsError::ConfigurationError(format!("Invalid address {}:{}: {}", self.host, self.port, e)))?
        .collect();
      let mut last_err = None;
      for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
          Ok(stream) => {
            let sock = socket2::SockRef::from(&stream);
            if let Err(e) = sock.set_keepalive(true) {
              warn!("Failed to enable TCP keepalive: {}", e);
            }
            stream.set_nodelay(true).map_err(|e| TwsError::SocketError(format!("Setting nodelay: {}", e)))?;
            stream
              .set_write_timeout(Some(timeout))
              .map_err(|e| TwsError::SocketError(format!("Setting write timeout: {}", e)))?;
            return Ok(stream);
          }
          Err(e) => last_err = Some(e),
        }
      }
      Err(TwsError::ConnectionFailed(match last_err {
        Some(e) => format!("Connect to {}:{} failed: {}", self.host, self.port, e),
        None => format!("No address resolved for {}:{}", self.host, self.port),
      }))
    }

    fn handshake(&mut self) -> Result<(), TwsError> {
      info!("Connecting to TWS at {}:{} (client id {})", self.host, self.port, self.client_id);
      let mut stream = self.open_stream()?;
      let timeout = self.options.connect_timeout;

      // H1: "API\0" + length-prefixed version range.
      let version_payload = client_version_string();
      let mut h1 = Vec::with_capacity(8 + version_payload.len());
      h1.extend_from_slice(b"API\0");
      h1.write_u32::<BigEndian>(version_payload.len() as u32)
        .map_err(|e| TwsError::InternalError(format!("Failed to encode H1 length: {}", e)))?;
      h1.extend_from_slice(version_payload.as_bytes());
      stream.write_all(&h1).map_err(|e| TwsError::ConnectionFailed(format!("Sending H1: {}", e)))?;
      stream.flush().map_err(|e| TwsError::ConnectionFailed(format!("Flushing H1: {}", e)))?;
      debug!("Sent H1 ({})", version_payload);

      // H2: serverVersion\0connectionTime\0
      stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| TwsError::SocketError(format!("Setting read timeout: {}", e)))?;
      let h2 = match read_frame(&mut stream, timeout) {
        Ok(Frame::Body(body)) => body,
        Ok(Frame::Idle) => return Err(TwsError::ConnectionFailed(format!("No handshake reply within {:?}", timeout))),
        Err(e) => return Err(TwsError::ConnectionFailed(format!("Reading H2: {}", e))),
      };
      let parts: Vec<&[u8]> = h2.splitn(3, |&b| b == 0).collect();
      if parts.len() < 2 || parts[0].is_empty() {
        return Err(TwsError::ParseError(format!("Invalid H2 body: {:02X?}", h2)));
      }
      let version_str = String::from_utf8_lossy(parts[0]);
      self.server_version = version_str
        .parse::<i32>()
        .map_err(|e| TwsError::ParseError(format!("Parsing server version '{}': {}", version_str, e)))?;
      self.connection_time = String::from_utf8_lossy(parts[1]).to_string();
      info!("Server version {}, connection time '{}'", self.server_version, self.connection_time);
      if self.server_version < min_server_ver::MIN_CLIENT_VERSION {
        return Err(TwsError::ConnectionFailed(format!("Server version {} is too old", self.server_version)));
      }
      if let Some(logger) = &self.logger {
        logger.set_server_version(self.server_version);
      }

      // H3: StartAPI. The gateway answers with NextValidId once accepted.
      let start_api = Encoder::new(self.server_version).encode_start_api(self.client_id, "")?;
      if let Some(logger) = &self.logger {
        logger.log_message(LogDirection::Send, &start_api);
      }
      write_frame(&mut stream, &start_api).map_err(|e| TwsError::ConnectionFailed(format!("Sending StartAPI: {}", e)))?;

      self.stream = Some(stream);
      Ok(())
    }

    fn start_reader_thread(&mut self, handler: Arc<dyn GatewayHandler>) -> Result<(), TwsError> {
      if self.reader_thread.is_some() {
        return Err(TwsError::InternalError("Reader thread already running".to_string()));
      }
      let mut reader_stream = self
        .stream
        .as_ref()
        .ok_or(TwsError::NotConnected)?
        .try_clone()
        .map_err(|e| TwsError::SocketError(format!("Cloning stream for reader: {}", e)))?;
      reader_stream
        .set_read_timeout(Some(READER_POLL))
        .map_err(|e| TwsError::SocketError(format!("Setting reader timeout: {}", e)))?;

      self.stop_flag.store(false, Ordering::SeqCst);
      self.reader_alive.store(true, Ordering::SeqCst);
      let stop_flag = self.stop_flag.clone();
      let alive = self.reader_alive.clone();
      let server_version = self.server_version;
      let logger = self.logger.clone();
      let (exit_tx, exit_rx) = bounded::<()>(1);

      let handle = thread::Builder::new()
        .name(format!("tws-reader-{}", self.client_id))
        .spawn(move || {
          debug!("Message reader thread started");
          loop {
            if stop_flag.load(Ordering::SeqCst) {
              break;
            }
            match read_frame(&mut reader_stream, READER_POLL) {
              Ok(Frame::Idle) => continue,
              Ok(Frame::Body(body)) => {
                if body.is_empty() {
                  continue;
                }
                if let Some(logger) = &logger {
                  logger.log_message(LogDirection::Recv, &body);
                }
                if let Err(e) = process_message(handler.as_ref(), server_version, &body) {
                  error!("Error processing message (type {:?}): {}", peek_message_type(&body).ok(), e);
                }
              }
              Err(e) => {
                if !stop_flag.load(Ordering::SeqCst) {
                  error!("Connection lost in reader thread: {}", e);
                  handler.connection_closed();
                }
                break;
              }
            }
          }
          alive.store(false, Ordering::SeqCst);
          trace!("Message reader thread ended");
          let _ = exit_tx.send(());
        })
        .map_err(|e| TwsError::InternalError(format!("Spawning reader thread: {}", e)))?;

      self.reader_thread = Some(handle);
      self.reader_exit = Some(exit_rx);
      Ok(())
    }
  }

  impl Connection for SocketConnection {
    fn is_connected(&self) -> bool {
      self.stream.is_some() && (self.reader_thread.is_none() || self.reader_alive.load(Ordering::SeqCst))
    }

    fn disconnect(&mut self) -> Result<(), TwsError> {
      if self.stream.is_none() && self.reader_thread.is_none() {
        return Ok(());
      }
      info!("Disconnecting from TWS");
      self.stop_flag.store(true, Ordering::SeqCst);
      if let Some(stream) = self.stream.take() {
        if let Err(e) = stream.shutdown(Shutdown::Both) {
          if e.kind() != ErrorKind::NotConnected {
            warn!("Error shutting down socket: {}", e);
          }
        }
      }

      if let (Some(handle), Some(exit_rx)) = (self.reader_thread.take(), self.reader_exit.take()) {
        match exit_rx.recv_timeout(self.options.disconnect_grace) {
          Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if handle.join().is_err() {
              error!("Reader thread panicked");
            }
          }
          Err(RecvTimeoutError::Timeout) => {
            warn!("Reader thread did not exit within {:?}; detaching it", self.options.disconnect_grace);
          }
        }
      }
      info!("Disconnected from TWS");
      Ok(())
    }

    fn send_message_body(&mut self, data: &[u8]) -> Result<(), TwsError> {
      if !self.is_connected() {
        return Err(TwsError::NotConnected);
      }
      let stream = self.stream.as_mut().ok_or(TwsError::NotConnected)?;
      // Logged before writing so a fast reply cannot be recorded ahead of it.
      if let Some(logger) = &self.logger {
        logger.log_message(LogDirection::Send, data);
      }
      write_frame(stream, data)
    }

    fn set_message_handler(&mut self, handler: Arc<dyn GatewayHandler>) {
      if let Err(e) = self.start_reader_thread(handler.clone()) {
        error!("Failed to start reader thread: {}", e);
        let _ = self.disconnect();
        handler.connection_closed();
      }
    }

    fn get_server_version(&self) -> i32 {
      self.server_version
    }
  }

  impl Drop for SocketConnection {
    fn drop(&mut self) {
      let _ = self.disconnect();
    }
  }

  #[cfg(test)]
  mod tests {
    use super::*;
    use crate::message_parser::tests::{Event, RecordingHandler};
    use std::net::TcpListener;

    fn framed(fields: &[&str]) -> Vec<u8> {
      let mut body = Vec::new();
      for f in fields {
        body.extend_from_slice(f.as_bytes());
        body.push(0);
      }
      let mut out = Vec::new();
      out.write_u32::<BigEndian>(body.len() as u32).unwrap();
      out.extend_from_slice(&body);
      out
    }

    fn read_body(stream: &mut TcpStream) -> Vec<u8> {
      let len = stream.read_u32::<BigEndian>().unwrap() as usize;
      let mut body = vec![0u8; len];
      stream.read_exact(&mut body).unwrap();
      body
    }

    #[test]
    fn handshake_dispatch_and_peer_close() {
      let listener = TcpListener::bind("127.0.0.1:0").unwrap();
      let port = listener.local_addr().unwrap().port();

      let server = thread::spawn(move || {
        let (mut s, _) = listener.accept().unwrap();
        let mut prefix = [0u8; 4];
        s.read_exact(&mut prefix).unwrap();
        assert_eq!(&prefix, b"API\0");
        let h1 = read_body(&mut s);
        assert_eq!(String::from_utf8(h1).unwrap(), client_version_string());
        s.write_all(&framed(&["176", "20240115 09:30:00 EST"])).unwrap();
        assert_eq!(read_body(&mut s), b"71\x002\x0042\x00\x00".to_vec());
        s.write_all(&framed(&["9", "1", "1000"])).unwrap();
        s.write_all(&framed(&["49", "1", "1705312800"])).unwrap();
        assert_eq!(read_body(&mut s), b"49\x001\x00".to_vec());
        // Dropping the socket closes it under the reader.
      });

      let mut conn = SocketConnection::connect("127.0.0.1", port, 42, SocketOptions::default(), None).unwrap();
      assert_eq!(conn.get_server_version(), 176);
      assert_eq!(conn.connection_time(), "20240115 09:30:00 EST");
      let handler = Arc::new(RecordingHandler::default());
      conn.set_message_handler(handler.clone());
      conn.send_message_body(b"49\x001\x00").unwrap();
      server.join().unwrap();

      let deadline = Instant::now() + Duration::from_secs(5);
      while !handler.events.lock().contains(&Event::Closed) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
      }
      assert_eq!(handler.take(), vec![Event::NextValidId(1000), Event::Time(1705312800), Event::Closed]);
      assert!(!conn.is_connected());
      conn.disconnect().unwrap();
      conn.disconnect().unwrap();
    }

    #[test]
    fn refused_connection_is_connect_error() {
      let listener = TcpListener::bind("127.0.0.1:0").unwrap();
      let port = listener.local_addr().unwrap().port();
      drop(listener);
      let opts = SocketOptions { connect_timeout: Duration::from_millis(500), ..Default::default() };
      match SocketConnection::connect("127.0.0.1", port, 1, opts, None) {
        Err(TwsError::ConnectionFailed(_)) => {}
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("connected to a closed port"),
      }
    }
  }
}
