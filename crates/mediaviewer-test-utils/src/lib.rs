use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[derive(Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl CapturedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("request body is json")
    }
}

/// A local stand-in for the media viewer service
pub struct StubViewer {
    pub base_url: String,
    requests: mpsc::Receiver<CapturedRequest>,
}

impl StubViewer {
    /// Next captured request; panics if none arrives within `timeout`
    pub fn next_request(&self, timeout: Duration) -> CapturedRequest {
        self.requests
            .recv_timeout(timeout)
            .expect("stub viewer received a request")
    }

    /// Whether a request arrived within `timeout`
    pub fn saw_request(&self, timeout: Duration) -> bool {
        self.requests.recv_timeout(timeout).is_ok()
    }
}

/// Accept a single request and answer with `status_line` and a JSON body.
pub fn spawn_stub_viewer(status_line: &str, response_body: &str) -> StubViewer {
    spawn_scripted_viewer(&[(status_line, response_body)])
}

/// Answer one request per scripted response, in order, then stop listening.
pub fn spawn_scripted_viewer(responses: &[(&str, &str)]) -> StubViewer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub viewer");
    let addr = listener.local_addr().expect("read stub viewer addr");
    let (tx, rx) = mpsc::channel();
    let responses: Vec<(String, String)> = responses
        .iter()
        .map(|(status, body)| (status.to_string(), body.to_string()))
        .collect();

    thread::spawn(move || {
        let mut responses = responses.into_iter();
        let mut next = responses.next();
        while let Some((status_line, response_body)) = &next {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            // Connections that close before a full request do not use up a response
            let Ok(req) = read_http_request(&stream) else {
                continue;
            };
            if tx.send(req).is_err() {
                return;
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                response_body.len(),
                response_body
            );
            let _ = stream.write_all(response.as_bytes());
            next = responses.next();
        }
    });

    StubViewer {
        base_url: format!("http://{addr}"),
        requests: rx,
    }
}

/// Accept one connection, read the request, and never answer.
///
/// The connection is held open for `hold` so clients hit their own timeout.
pub fn spawn_silent_viewer(hold: Duration) -> StubViewer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind silent viewer");
    let addr = listener.local_addr().expect("read silent viewer addr");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        if let Ok(req) = read_http_request(&stream) {
            let _ = tx.send(req);
        }
        thread::sleep(hold);
    });

    StubViewer {
        base_url: format!("http://{addr}"),
        requests: rx,
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn read_http_request(stream: &TcpStream) -> io::Result<CapturedRequest> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return Err(invalid("malformed request line"));
    };
    let (method, path) = (method.to_string(), path.to_string());

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| invalid("bad content-length"))?,
        None => 0,
    };
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    let body = String::from_utf8(body).map_err(|_| invalid("body is not utf-8"))?;

    Ok(CapturedRequest {
        method,
        path,
        headers,
        body,
    })
}
