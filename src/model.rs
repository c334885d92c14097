// src/model.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound control frame, e.g. `{"type":"subscribe","symbol":"AAPL"}`.
#[derive(Debug, Serialize)]
pub struct ControlMessage<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub symbol: &'a str,
}

impl<'a> ControlMessage<'a> {
    pub fn subscribe(symbol: &'a str) -> Self {
        ControlMessage {
            kind: "subscribe",
            symbol,
        }
    }
}

/// Tagged inbound frame. Only trades carry data we act on.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TaggedFrame {
    Trade {
        #[serde(default)]
        data: Vec<Value>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct TradeRecord {
    #[serde(rename = "s")]
    pub(crate) symbol: String,
    #[serde(rename = "p")]
    pub(crate) price: f64,
    #[serde(rename = "t")]
    pub(crate) timestamp: i64,
    #[serde(rename = "v")]
    pub(crate) volume: f64,
}

/// One decoded price update.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: i64,
}

impl From<TradeRecord> for Tick {
    fn from(r: TradeRecord) -> Self {
        Tick {
            symbol: r.symbol,
            price: r.price,
            volume: r.volume,
            timestamp: r.timestamp,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum FeedFrame {
    Trades { ticks: Vec<Tick>, malformed: usize },
    Other,
}

/// Decodes one text frame from the feed.
///
/// A frame that is not valid JSON, or a `trade` frame whose `data` is not an
/// array, is an error. Individual trade records that fail to decode (or carry
/// an empty symbol) are skipped and counted in `malformed`. Objects without a
/// `type` string, and every non-trade type, decode to [`FeedFrame::Other`].
pub fn decode_frame(text: &str) -> Result<FeedFrame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let has_tag = value.get("type").map(Value::is_string).unwrap_or(false);
    if !has_tag {
        return Ok(FeedFrame::Other);
    }
    match serde_json::from_value::<TaggedFrame>(value)? {
        TaggedFrame::Trade { data } => {
            let mut ticks = Vec::with_capacity(data.len());
            let mut malformed = 0;
            for raw in data {
                match serde_json::from_value::<TradeRecord>(raw) {
                    Ok(rec) if !rec.symbol.is_empty() => ticks.push(Tick::from(rec)),
                    _ => malformed += 1,
                }
            }
            Ok(FeedFrame::Trades { ticks, malformed })
        }
        TaggedFrame::Other => Ok(FeedFrame::Other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_message_shape() {
        let json = serde_json::to_string(&ControlMessage::subscribe("BINANCE:BTCUSDT")).unwrap();
        assert_eq!(json, r#"{"type":"subscribe","symbol":"BINANCE:BTCUSDT"}"#);
    }

    #[test]
    fn decode_trade_frame() {
        let json = r#"{
            "type": "trade",
            "data": [
                {"s": "AAPL", "p": 189.52, "t": 1730836779020, "v": 12, "c": ["1", "12"]},
                {"s": "BINANCE:BTCUSDT", "p": 68011.1, "t": 1730836779021, "v": 0.0041}
            ]
        }"#;
        match decode_frame(json).unwrap() {
            FeedFrame::Trades { ticks, malformed } => {
                assert_eq!(malformed, 0);
                assert_eq!(ticks.len(), 2);
                assert_eq!(ticks[0].symbol, "AAPL");
                assert_eq!(ticks[0].price, 189.52);
                assert_eq!(ticks[0].volume, 12.0);
                assert_eq!(ticks[0].timestamp, 1730836779020);
                assert_eq!(ticks[1].symbol, "BINANCE:BTCUSDT");
            }
            other => panic!("expected trades, got {:?}", other),
        }
    }

    #[test]
    fn malformed_records_are_skipped_not_fatal() {
        let json = r#"{"type":"trade","data":[
            {"p": 1.0, "t": 1, "v": 1},
            {"s": "", "p": 1.0, "t": 1, "v": 1},
            {"s": "MSFT", "p": "oops", "t": 1, "v": 1},
            {"s": "MSFT", "p": 411.2, "t": 2, "v": 3}
        ]}"#;
        match decode_frame(json).unwrap() {
            FeedFrame::Trades { ticks, malformed } => {
                assert_eq!(malformed, 3);
                assert_eq!(ticks.len(), 1);
                assert_eq!(ticks[0].symbol, "MSFT");
            }
            other => panic!("expected trades, got {:?}", other),
        }
    }

    #[test]
    fn non_trade_frames_are_other() {
        assert_eq!(decode_frame(r#"{"type":"ping"}"#).unwrap(), FeedFrame::Other);
        assert_eq!(
            decode_frame(r#"{"type":"error","msg":"Invalid symbol"}"#).unwrap(),
            FeedFrame::Other
        );
        assert_eq!(decode_frame(r#"{"msg":"hello"}"#).unwrap(), FeedFrame::Other);
        assert_eq!(decode_frame("[]").unwrap(), FeedFrame::Other);
    }

    #[test]
    fn trade_frame_without_data_is_empty() {
        assert_eq!(
            decode_frame(r#"{"type":"trade"}"#).unwrap(),
            FeedFrame::Trades { ticks: vec![], malformed: 0 }
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(decode_frame("{not json").is_err());
        assert!(decode_frame(r#"{"type":"trade","data":5}"#).is_err());
    }
}
