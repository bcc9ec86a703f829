//! Incremental HTTP/1.1 request parser: drives a state machine forward
//! as bytes arrive on a connection's input buffer, so a request spread
//! across several reads is parsed without blocking or copying the whole
//! thing up front.

use crate::buffer::Buffer;
use crate::error::HttpError;

use super::request::{Request, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ExpectRequestLine,
    ExpectHeaders,
    ExpectBody,
    ExpectChunkSize,
    ExpectChunkBody,
    ExpectChunkFooter,
    ExpectLastChunk,
    GotAll,
}

pub struct Parser {
    state: State,
    chunk_left: usize,
    request: Request,
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            state: State::ExpectRequestLine,
            chunk_left: 0,
            request: Request::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = State::ExpectRequestLine;
        self.chunk_left = 0;
        self.request = Request::new();
    }

    pub fn got_all(&self) -> bool {
        self.state == State::GotAll
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn take_request(&mut self) -> Request {
        std::mem::replace(&mut self.request, Request::new())
    }

    /// Advances the state machine as far as `buf`'s contents allow.
    /// Leaves unconsumed bytes in `buf` for the next call. Returns `Err`
    /// only on a malformed request; an incomplete one simply leaves
    /// `got_all()` false.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<(), HttpError> {
        loop {
            match self.state {
                State::ExpectRequestLine => {
                    let Some(pos) = buf.find_crlf() else { return Ok(()) };
                    let line = buf.peek()[..pos].to_vec();
                    self.parse_request_line(&line)?;
                    buf.retrieve(pos + 2);
                    self.state = State::ExpectHeaders;
                }
                State::ExpectHeaders => {
                    let Some(pos) = buf.find_crlf() else { return Ok(()) };
                    let line = buf.peek()[..pos].to_vec();
                    if let Some(colon) = line.iter().position(|&b| b == b':') {
                        self.request.add_header(&line[..colon], &line[colon + 1..]);
                    } else if line.is_empty() {
                        self.state = if self.request.header("Transfer-Encoding") == Some("chunked") {
                            State::ExpectChunkSize
                        } else {
                            State::ExpectBody
                        };
                    } else {
                        return Err(HttpError::MalformedHeader);
                    }
                    buf.retrieve(pos + 2);
                }
                State::ExpectBody => {
                    use super::request::Method;
                    if matches!(self.request.method(), Method::Post | Method::Put) {
                        let Some(len_str) = self.request.header("Content-Length") else {
                            self.state = State::GotAll;
                            return Ok(());
                        };
                        let content_length: usize =
                            len_str.parse().map_err(|_| HttpError::InvalidContentLength)?;
                        if buf.readable_bytes() >= content_length {
                            self.request.set_body(buf.peek()[..content_length].to_vec());
                            buf.retrieve(content_length);
                            self.state = State::GotAll;
                        }
                        return Ok(());
                    } else {
                        self.state = State::GotAll;
                        return Ok(());
                    }
                }
                State::ExpectChunkSize => {
                    let Some(pos) = buf.find_crlf() else { return Ok(()) };
                    let size_str = std::str::from_utf8(&buf.peek()[..pos]).map_err(|_| HttpError::InvalidChunkSize)?;
                    self.chunk_left =
                        usize::from_str_radix(size_str.trim(), 16).map_err(|_| HttpError::InvalidChunkSize)?;
                    buf.retrieve(pos + 2);
                    self.state = if self.chunk_left == 0 {
                        State::ExpectLastChunk
                    } else {
                        State::ExpectChunkBody
                    };
                }
                State::ExpectChunkBody => {
                    if buf.readable_bytes() >= self.chunk_left {
                        self.request.append_body(&buf.peek()[..self.chunk_left]);
                        buf.retrieve(self.chunk_left);
                        self.chunk_left = 0;
                        self.state = State::ExpectChunkFooter;
                    } else {
                        return Ok(());
                    }
                }
                State::ExpectChunkFooter => {
                    let Some(pos) = buf.find_crlf() else { return Ok(()) };
                    buf.retrieve(pos + 2);
                    self.state = State::ExpectChunkSize;
                }
                State::ExpectLastChunk => {
                    let Some(pos) = buf.find_crlf() else { return Ok(()) };
                    if pos != 0 {
                        return Err(HttpError::InvalidChunkSize);
                    }
                    buf.retrieve(pos + 2);
                    self.state = State::GotAll;
                    return Ok(());
                }
                State::GotAll => return Ok(()),
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), HttpError> {
        let mut parts = line.splitn(3, |&b| b == b' ');
        let method = parts.next().ok_or(HttpError::MalformedRequestLine)?;
        let target = parts.next().ok_or(HttpError::MalformedRequestLine)?;
        let version = parts.next().ok_or(HttpError::MalformedRequestLine)?;

        if !self.request.set_method(method) {
            return Err(HttpError::MalformedRequestLine);
        }

        if let Some(q) = target.iter().position(|&b| b == b'?') {
            self.request.set_path(&target[..q]);
            self.request.set_query(&target[q + 1..]);
        } else {
            self.request.set_path(target);
        }

        match version {
            b"HTTP/1.1" => self.request.set_version(Version::Http11),
            b"HTTP/1.0" => self.request.set_version(Version::Http10),
            _ => return Err(HttpError::MalformedRequestLine),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get_in_one_shot() {
        let mut buf = Buffer::new();
        buf.append(b"GET /foo?bar=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let mut parser = Parser::new();
        parser.parse(&mut buf).unwrap();
        assert!(parser.got_all());
        assert_eq!(parser.request().path(), "/foo");
        assert_eq!(parser.request().query(), "bar=1");
        assert_eq!(parser.request().header("Host"), Some("example.com"));
    }

    #[test]
    fn parses_request_arriving_byte_by_byte() {
        let full = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut buf = Buffer::new();
        let mut parser = Parser::new();
        for &byte in full {
            buf.append(&[byte]);
            parser.parse(&mut buf).unwrap();
        }
        assert!(parser.got_all());
        assert_eq!(parser.request().body(), b"hello");
    }

    #[test]
    fn parses_chunked_body() {
        let mut buf = Buffer::new();
        buf.append(b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        let mut parser = Parser::new();
        parser.parse(&mut buf).unwrap();
        assert!(parser.got_all());
        assert_eq!(parser.request().body(), b"Wikipedia");
    }

    #[test]
    fn rejects_malformed_request_line() {
        let mut buf = Buffer::new();
        buf.append(b"BOGUS\r\n\r\n");
        let mut parser = Parser::new();
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn get_without_content_length_has_no_body_state() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\n\r\n");
        let mut parser = Parser::new();
        parser.parse(&mut buf).unwrap();
        assert!(parser.got_all());
        assert!(parser.request().body().is_empty());
    }
}
