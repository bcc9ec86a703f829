//! A response to be serialized onto a connection's output buffer.

use crate::buffer::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    Unknown = 0,
    SwitchingProtocols = 101,
    Ok = 200,
    Created = 201,
    MovedPermanently = 301,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    Conflict = 409,
    InternalServerError = 500,
}

impl StatusCode {
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Unknown => "",
            StatusCode::SwitchingProtocols => "Switching Protocols",
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::Conflict => "Conflict",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

pub struct Response {
    status: StatusCode,
    status_message: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    close_connection: bool,
    file_path: Option<String>,
    file_len: u64,
    chunked: bool,
}

impl Response {
    pub fn new(close: bool) -> Self {
        Response {
            status: StatusCode::Unknown,
            status_message: String::new(),
            headers: Vec::new(),
            body: Vec::new(),
            close_connection: close,
            file_path: None,
            file_len: 0,
            chunked: false,
        }
    }

    pub fn set_status_code(&mut self, code: StatusCode) {
        self.status = code;
        if self.status_message.is_empty() {
            self.status_message = code.reason_phrase().to_string();
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = message.into();
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push((key.into(), value.into()));
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.set_header("Content-Type", content_type);
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Marks this response as a zero-copy file transfer: headers are sent
    /// from `self.body` as usual, but the body itself is sent separately
    /// (see `Connection::send_file`) straight from `path`'s fd, so
    /// `append_to_buffer` must not write any body bytes of its own.
    pub fn set_file_path(&mut self, path: impl Into<String>, len: u64) {
        self.file_path = Some(path.into());
        self.file_len = len;
    }

    pub fn file_path(&self) -> Option<&str> {
        self.file_path.as_deref()
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub fn set_chunked_encoding(&mut self, on: bool) {
        self.chunked = on;
    }

    pub fn set_content_length(&mut self, length: usize) {
        self.set_header("Content-Length", length.to_string());
    }

    pub fn set_last_modified(&mut self, time: impl Into<String>) {
        self.set_header("Last-Modified", time);
    }

    pub fn set_etag(&mut self, etag: impl Into<String>) {
        self.set_header("ETag", etag);
    }

    pub fn set_cache_control(&mut self, value: impl Into<String>) {
        self.set_header("Cache-Control", value);
    }

    /// Serializes status line, headers, and body onto `output`, in the
    /// exact order the wire format expects: status line, then
    /// Content-Length/Transfer-Encoding, then Connection, then the rest
    /// of the explicitly set headers, then the blank line, then body
    /// (chunk-framed if `chunked`).
    pub fn append_to_buffer(&self, output: &mut Buffer) {
        output.append(format!("HTTP/1.1 {} ", self.status as u16).as_bytes());
        output.append(self.status_message.as_bytes());
        output.append(b"\r\n");

        if self.chunked {
            output.append(b"Transfer-Encoding: chunked\r\n");
        } else if self.file_path.is_some() {
            output.append(format!("Content-Length: {}\r\n", self.file_len).as_bytes());
        } else {
            output.append(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        if self.close_connection {
            output.append(b"Connection: close\r\n");
        } else {
            output.append(b"Connection: Keep-Alive\r\n");
        }

        for (key, value) in &self.headers {
            output.append(key.as_bytes());
            output.append(b": ");
            output.append(value.as_bytes());
            output.append(b"\r\n");
        }

        output.append(b"\r\n");

        if self.chunked {
            if !self.body.is_empty() {
                output.append(format!("{:x}\r\n", self.body.len()).as_bytes());
                output.append(&self.body);
                output.append(b"\r\n");
            }
            output.append(b"0\r\n\r\n");
        } else if self.file_path.is_none() {
            output.append(&self.body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_simple_ok_response() {
        let mut resp = Response::new(false);
        resp.set_status_code(StatusCode::Ok);
        resp.set_content_type("text/plain");
        resp.set_body(b"hi".to_vec());
        let mut buf = Buffer::new();
        resp.append_to_buffer(&mut buf);
        let text = buf.retrieve_all_as_string();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: Keep-Alive\r\n"));
        assert!(text.ends_with("hi"));
    }

    #[test]
    fn file_response_sends_length_header_but_no_inline_body() {
        let mut resp = Response::new(false);
        resp.set_status_code(StatusCode::Ok);
        resp.set_file_path("/tmp/whatever", 12345);
        let mut buf = Buffer::new();
        resp.append_to_buffer(&mut buf);
        let text = buf.retrieve_all_as_string();
        assert!(text.contains("Content-Length: 12345\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn chunked_response_frames_body_and_trailer() {
        let mut resp = Response::new(true);
        resp.set_status_code(StatusCode::Ok);
        resp.set_chunked_encoding(true);
        resp.set_body(b"abc".to_vec());
        let mut buf = Buffer::new();
        resp.append_to_buffer(&mut buf);
        let text = buf.retrieve_all_as_string();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("3\r\nabc\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }
}
