//! Shared helpers for the runner integration tests.

#![allow(dead_code)]

use chrono::NaiveDate;
use marketpulse_core::data::{DataError, DataProvider, FetchResult};
use marketpulse_core::domain::{DailyRecord, DatasetMeta, Instrument, InstrumentDataset};
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn rec(close: f64) -> DailyRecord {
    DailyRecord {
        open: close - 1.0,
        high: close + 1.0,
        low: close - 2.0,
        close,
        volume: 1_000,
    }
}

pub fn dataset(symbol: &str, days: &[(&str, f64)]) -> InstrumentDataset {
    let meta = DatasetMeta {
        symbol: Some(symbol.to_string()),
        ..DatasetMeta::default()
    };
    let series: BTreeMap<_, _> = days.iter().map(|(d, c)| (date(d), rec(*c))).collect();
    InstrumentDataset::new(meta, series)
}

/// Provider answering from a fixed table; symbols missing from it fail with HTTP 500.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    responses: Arc<Mutex<HashMap<String, InstrumentDataset>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProvider {
    pub fn respond(&self, symbol: &str, data: InstrumentDataset) {
        self.responses.lock().unwrap().insert(symbol.to_string(), data);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl DataProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(&self, instrument: &Instrument) -> Result<FetchResult, DataError> {
        let request = instrument.request_symbol().to_string();
        self.calls.lock().unwrap().push(request.clone());
        match self.responses.lock().unwrap().get(&request) {
            Some(data) => Ok(FetchResult {
                symbol: instrument.symbol.clone(),
                request_symbol: request,
                dataset: data.clone(),
                source: "scripted".into(),
            }),
            None => Err(DataError::Http {
                symbol: request,
                status: 500,
            }),
        }
    }
}

/// One request as seen by [`MockServer`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Minimal HTTP/1.1 server on a loopback port. One request per connection.
pub struct MockServer {
    pub url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockServer {
    /// `handler(method, path_with_query, body)` returns `(status, body)`.
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &str, &str) -> (u16, String) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().unwrap());

                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let path = parts.next().unwrap_or_default().to_string();

                let mut headers = HashMap::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 {
                        break;
                    }
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if let Some((k, v)) = line.split_once(':') {
                        headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
                    }
                }

                let len = headers
                    .get("content-length")
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                let mut body = vec![0u8; len];
                let _ = reader.read_exact(&mut body);
                let body = String::from_utf8_lossy(&body).into_owned();

                let (status, reply) = handler(&method, &path, &body);
                seen.lock().unwrap().push(Recorded {
                    method,
                    path,
                    headers,
                    body,
                });

                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
                    reply.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });

        Self { url, requests }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| format!("{} {}", r.method, r.path)).collect()
    }
}
