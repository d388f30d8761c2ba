use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {

    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("error decoding tracker response: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("tracker returned failure: {0}")]
    Failure(String),

}

type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Started,
    Completed,
    Stopped,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Completed => write!(f, "completed"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceParams {

    pub info_hash: [u8; 20],

    pub peer_id: [u8; 20],

    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    pub left: u64,

    pub event: Option<Event>,

}

// A single tracker's announce endpoint, spoken over plain HTTP GET per
// spec.md's wire interface. One of these exists per tier entry; the
// coordinator walks tiers in priority order.
pub struct TrackerClient {

    client: reqwest::Client,

    url: Url,

    tracker_id: Option<String>,

}

impl TrackerClient {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            tracker_id: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    #[tracing::instrument(skip(self, params), fields(url = %self.url))]
    pub async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse> {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url.as_str(),
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.peer_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(tracker_id) = &self.tracker_id {
            url.push_str(&format!("&trackerid={}", tracker_id));
        }
        tracing::debug!("announce url: {}", url);

        let raw = self.client.get(url).send().await?.bytes().await?;
        let resp: HttpResponse = bencode::decode_bytes(&raw)?;
        tracing::debug!("announce response: {:#?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::Failure(failure));
        }
        if let Some(warning) = &resp.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }
        if let Some(tracker_id) = resp.tracker_id {
            self.tracker_id = Some(tracker_id);
        }

        Ok(AnnounceResponse {
            interval: resp.interval.map(Duration::from_secs),
            peers: resp.peers,
        })
    }
}

#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

#[derive(Deserialize, Debug, Default)]
struct HttpResponse {

    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,

    #[serde(rename = "warning message")]
    warning_message: Option<String>,

    interval: Option<u64>,

    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,

    #[serde(default)]
    complete: Option<u64>,

    #[serde(default)]
    incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peer_deserialize")]
    peers: Vec<SocketAddr>,
}

// The tracker may return either a compact byte string or a list of
// dictionaries for `peers`, regardless of the `compact` parameter we sent.
fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peer string or a list of peer dictionaries")
        }

        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not a multiple of 6 bytes"));
            }
            let mut peers = Vec::with_capacity(v.len() / 6);
            while v.remaining() >= 6 {
                peers.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(v.get_u32())), v.get_u16()));
            }
            Ok(peers)
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                if let Ok(ip) = peer.ip.parse::<Ipv4Addr>() {
                    peers.push(SocketAddr::new(IpAddr::V4(ip), peer.port));
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_list() {
        let s = "64383a636f6d706c65746569396531303a696e636f6d706c657465693165383a696e74657276616c69313830306531323a6d696e20696e74657276616c693138303065353a706565727336303a52454d051ae1ca2f2a2ec00884937726decc61759ab8138851ab05e8f6bb5062f69770469247493ad4d005879f2ec8d54237ce44ea6043db8806c8d565";
        let response: HttpResponse = bencode::decode_bytes(&hex::decode(s).unwrap()).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.complete, Some(9));
        assert_eq!(response.incomplete, Some(1));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(97, 117, 154, 184)), 5000)));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(5, 135, 159, 46)), 51413)));
    }

    #[test]
    fn parses_dictionary_peer_list() {
        #[derive(serde_derive::Serialize)]
        struct Peer { ip: String, port: u16 }
        #[derive(serde_derive::Serialize)]
        struct Resp { interval: u64, peers: Vec<Peer> }

        let resp = Resp {
            interval: 900,
            peers: vec![Peer { ip: "192.168.0.5".into(), port: 6881 }],
        };
        let encoded = bencode::encode_to_raw(&resp).unwrap();
        let decoded: HttpResponse = bencode::decode_bytes(&encoded).unwrap();
        assert_eq!(decoded.interval, Some(900));
        assert_eq!(decoded.peers, vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 5)), 6881)]);
    }
}
