use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::{Client, ClientBuilder};
use thiserror::Error;
use url::Url;

use crate::{bencoding::Value, manager::piece_scheduler::TransferStats, util::force_string};

const COMPACT: i32 = 1;
const NUMWANT: u32 = 50;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid tracker url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http request to tracker failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("scheme of url not supported: {0}")]
    UnsupportedScheme(String),
    #[error("tracker responded with failure: \"{0}\"")]
    Failure(String),
    #[error("invalid tracker response: {0}")]
    InvalidResponse(String),
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum Event {
    None,
    Started,
    Stopped,
    Completed,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Event::None => "",
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

#[derive(PartialEq, Debug)]
pub struct Announce {
    pub interval: Duration, // how long the client should wait before asking again
    pub peers: Vec<SocketAddr>,
    pub seeders: Option<i64>,
    pub leechers: Option<i64>,
}

/// Anything able to hand out candidate peers for the torrent.
#[trait_variant::make(Send)]
pub trait PeerSource {
    async fn fetch_peers(
        &mut self,
        event: Event,
        stats: TransferStats,
    ) -> Result<Announce, TrackerError>;
}

#[derive(Debug)]
pub struct TrackerClient {
    announce_url: String,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    listening_port: u16,
    client: Client,
}

impl TrackerClient {
    pub fn new(
        announce_url: String,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        listening_port: u16,
    ) -> Result<Self, TrackerError> {
        if !announce_url.starts_with("http://") && !announce_url.starts_with("https://") {
            return Err(TrackerError::UnsupportedScheme(announce_url));
        }
        let client = ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(TrackerClient {
            announce_url,
            info_hash,
            peer_id,
            listening_port,
            client,
        })
    }

    fn announce_url(&self, event: Event, stats: TransferStats) -> Result<Url, TrackerError> {
        let mut params = vec![
            ("port", self.listening_port.to_string()),
            ("uploaded", stats.uploaded_bytes.to_string()),
            ("downloaded", stats.downloaded_bytes.to_string()),
            ("left", stats.left_bytes.to_string()),
            ("compact", COMPACT.to_string()),
            ("numwant", NUMWANT.to_string()),
        ];
        if event != Event::None {
            params.push(("event", event.to_string()));
        }
        let mut url = Url::parse_with_params(&self.announce_url, &params)?;

        // raw bytes must not be url encoded again by the url crate
        let binary_params = format!(
            "info_hash={}&peer_id={}",
            percent_encode(&self.info_hash, NON_ALPHANUMERIC),
            percent_encode(&self.peer_id, NON_ALPHANUMERIC)
        );
        let query = match url.query() {
            Some(q) if !q.is_empty() => format!("{binary_params}&{q}"),
            _ => binary_params,
        };
        url.set_query(Some(&query));
        Ok(url)
    }
}

impl PeerSource for TrackerClient {
    async fn fetch_peers(
        &mut self,
        event: Event,
        stats: TransferStats,
    ) -> Result<Announce, TrackerError> {
        let url = self.announce_url(event, stats)?;
        log::debug!("requesting url: {url}");
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_response(&body)
    }
}

fn parse_response(body: &[u8]) -> Result<Announce, TrackerError> {
    let response_map = match Value::new(body) {
        Ok(Value::Dict(m, _, _)) => m,
        _ => {
            return Err(TrackerError::InvalidResponse(
                "the server response was not a valid bencoded map".to_string(),
            ));
        }
    };

    if let Some(Value::Str(failure_reason)) = response_map.get(&b"failure reason".to_vec()) {
        return Err(TrackerError::Failure(force_string(failure_reason)));
    }

    if let Some(Value::Str(warning)) = response_map.get(&b"warning message".to_vec()) {
        log::warn!("tracker warning: {}", force_string(warning));
    }

    let interval = match (
        response_map.get(&b"interval".to_vec()),
        response_map.get(&b"min interval".to_vec()),
    ) {
        (Some(Value::Int(i)), _) | (None, Some(Value::Int(i))) if *i > 0 => {
            Duration::from_secs(*i as u64)
        }
        _ => DEFAULT_INTERVAL,
    };

    let peers = match response_map.get(&b"peers".to_vec()) {
        Some(Value::List(peers_list)) => get_peers_with_dict_model(peers_list)?,
        Some(Value::Str(peers_bytes)) => get_peers_with_binary_model(peers_bytes)?,
        None => Vec::new(),
        _ => {
            return Err(TrackerError::InvalidResponse(
                "peers key provided but it was not a list or string".to_string(),
            ));
        }
    };

    let int_field = |key: &[u8]| match response_map.get(&key.to_vec()) {
        Some(Value::Int(i)) => Some(*i),
        _ => None,
    };

    Ok(Announce {
        interval,
        peers,
        seeders: int_field(b"complete"),
        leechers: int_field(b"incomplete"),
    })
}

fn get_peers_with_dict_model(peers_values: &[Value]) -> Result<Vec<SocketAddr>, TrackerError> {
    let mut peers_list = Vec::new();
    for v in peers_values {
        let Value::Dict(peer_dict, _, _) = v else {
            return Err(TrackerError::InvalidResponse(
                "peers list contains a value that is not a dict".to_string(),
            ));
        };
        let ip = match peer_dict.get(&b"ip".to_vec()) {
            Some(Value::Str(ip_vec)) => force_string(ip_vec),
            _ => {
                return Err(TrackerError::InvalidResponse(
                    "ip key not provided in list of peers or it is not a string".to_string(),
                ));
            }
        };
        let port = match peer_dict.get(&b"port".to_vec()) {
            Some(Value::Int(p)) => u16::try_from(*p).map_err(|_| {
                TrackerError::InvalidResponse(format!("peer port {p} is not valid"))
            })?,
            _ => {
                return Err(TrackerError::InvalidResponse(
                    "port key not provided in list of peers or it is not a number".to_string(),
                ));
            }
        };
        match ip.parse::<IpAddr>() {
            Ok(addr) => peers_list.push(SocketAddr::new(addr, port)),
            Err(_) => log::debug!("ignoring peer with non ip address: {ip}"),
        }
    }
    Ok(peers_list)
}

fn get_peers_with_binary_model(peers_bytes: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
    if peers_bytes.len() % 6 != 0 {
        return Err(TrackerError::InvalidResponse(
            "peers list is provided in binary model but it is not aligned to 6 bytes".to_string(),
        ));
    }
    Ok(peers_bytes
        .chunks_exact(6)
        .map(|p| {
            let ip = Ipv4Addr::new(p[0], p[1], p[2], p[3]);
            let port = u16::from_be_bytes([p[4], p[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}
