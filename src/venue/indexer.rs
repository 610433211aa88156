use crate::config::Credentials;
use crate::models::{AccountSnapshot, Candle, Timeframe, VenueTrade};
use crate::venue::{Fill, OrderSide, VenueClient};
use crate::Result;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

pub const TESTNET_REST: &str = "https://dydx-testnet.imperator.co/v4";
pub const TESTNET_WS: &str = "wss://indexer.v4testnet.dydx.exchange/v4/ws";

/// Trades buffered between socket reads before the feed starts shedding.
const TRADE_CHANNEL_CAPACITY: usize = 1024;

/// dYdX v4 indexer client: candles and account state over REST, the
/// `v4_trades` channel over WebSocket. The indexer is a read-only surface;
/// order submission needs a signing node client and is reported as such.
#[derive(Clone)]
pub struct IndexerClient {
    http: Client,
    rest_url: String,
    ws_url: String,
    credentials: Option<Credentials>,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Vec<CandleDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandleDto {
    started_at: DateTime<Utc>,
    open: String,
    high: String,
    low: String,
    close: String,
    base_token_volume: String,
}

#[derive(Debug, Deserialize)]
struct SubaccountResponse {
    subaccount: SubaccountDto,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubaccountDto {
    equity: String,
    free_collateral: String,
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    contents: Option<WsContents>,
}

#[derive(Debug, Deserialize)]
struct WsContents {
    #[serde(default)]
    trades: Vec<WsTrade>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsTrade {
    price: String,
    size: String,
    created_at: DateTime<Utc>,
}

impl IndexerClient {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self::with_endpoints(TESTNET_REST, TESTNET_WS, credentials)
    }

    pub fn with_endpoints(rest_url: &str, ws_url: &str, credentials: Option<Credentials>) -> Self {
        Self {
            http: Client::new(),
            rest_url: rest_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
            credentials,
        }
    }

    /// Indexer resolution vocabulary differs from ours; translate at the
    /// boundary.
    fn resolution(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "1MIN",
            Timeframe::M5 => "5MINS",
            Timeframe::M15 => "15MINS",
            Timeframe::M30 => "30MINS",
            Timeframe::H1 => "1HOUR",
            Timeframe::H4 => "4HOURS",
            Timeframe::D1 => "1DAY",
        }
    }

    fn parse_candle(dto: CandleDto, timeframe: Timeframe) -> Result<Candle> {
        Ok(Candle {
            start_time: dto.started_at,
            timeframe,
            open: dto.open.parse().context("bad candle open")?,
            high: dto.high.parse().context("bad candle high")?,
            low: dto.low.parse().context("bad candle low")?,
            close: dto.close.parse().context("bad candle close")?,
            volume: dto
                .base_token_volume
                .parse()
                .context("bad candle volume")?,
        })
    }
}

#[async_trait]
impl VenueClient for IndexerClient {
    async fn get_candles(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/candles/perpetualMarkets/{}",
            self.rest_url, instrument
        );
        let limit = limit.to_string();
        let response: CandlesResponse = self
            .http
            .get(&url)
            .query(&[
                ("resolution", Self::resolution(timeframe)),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // The indexer returns newest-first.
        let mut candles = response
            .candles
            .into_iter()
            .map(|dto| Self::parse_candle(dto, timeframe))
            .collect::<Result<Vec<_>>>()?;
        candles.sort_by_key(|c| c.start_time);
        Ok(candles)
    }

    async fn subscribe_trades(&self, instrument: &str) -> Result<mpsc::Receiver<VenueTrade>> {
        let (ws_stream, _) = connect_async(self.ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect to {}", self.ws_url))?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::json!({
            "type": "subscribe",
            "channel": "v4_trades",
            "id": instrument,
        });
        write.send(Message::Text(subscribe.to_string())).await?;

        let (tx, rx) = mpsc::channel(TRADE_CHANNEL_CAPACITY);
        let instrument = instrument.to_string();

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(payload)) => {
                        let envelope: WsEnvelope = match serde_json::from_str(&payload) {
                            Ok(e) => e,
                            Err(err) => {
                                tracing::debug!(%err, "unparseable trade feed payload");
                                continue;
                            }
                        };
                        // The initial "subscribed" message carries historical
                        // trades; only live channel_data is forwarded.
                        if envelope.kind != "channel_data" {
                            continue;
                        }
                        let Some(contents) = envelope.contents else {
                            continue;
                        };
                        for trade in contents.trades {
                            let (Ok(price), Ok(size)) =
                                (trade.price.parse::<f64>(), trade.size.parse::<f64>())
                            else {
                                tracing::debug!(instrument, "dropping malformed trade");
                                continue;
                            };
                            let venue_trade = VenueTrade {
                                price,
                                size,
                                at: trade.created_at,
                            };
                            if let Err(err) = tx.try_send(venue_trade) {
                                match err {
                                    mpsc::error::TrySendError::Full(_) => {
                                        // Shed load; closed candles are
                                        // re-sourced from snapshots anyway.
                                        tracing::debug!(instrument, "trade queue full, shedding");
                                    }
                                    mpsc::error::TrySendError::Closed(_) => return,
                                }
                            }
                        }
                    }
                    Ok(Message::Ping(frame)) => {
                        let _ = write.send(Message::Pong(frame)).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(%err, instrument, "trade stream error");
                        break;
                    }
                }
            }
            // Dropping tx closes the receiver; the market-data task owns
            // reconnection.
        });

        Ok(rx)
    }

    async fn get_account(&self) -> Result<AccountSnapshot> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| anyhow!("no account configured; run `breakoutbot setup` first"))?;
        let url = format!(
            "{}/addresses/{}/subaccountNumber/{}",
            self.rest_url, creds.address, creds.subaccount
        );
        let response: SubaccountResponse = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(AccountSnapshot {
            equity_usd: response
                .subaccount
                .equity
                .parse()
                .context("bad equity in subaccount response")?,
            free_collateral_usd: response
                .subaccount
                .free_collateral
                .parse()
                .context("bad freeCollateral in subaccount response")?,
        })
    }

    async fn place_market_order(
        &self,
        _instrument: &str,
        _side: OrderSide,
        _size_base: f64,
        _client_id: Uuid,
    ) -> Result<Fill> {
        bail!(
            "the indexer surface is read-only; live order submission requires a \
             signing node client. Run with --simulation."
        );
    }

    async fn cancel_order(&self, _client_id: Uuid) -> Result<()> {
        bail!("the indexer surface is read-only; nothing to cancel");
    }
}
