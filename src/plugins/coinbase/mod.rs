//! Coin price plugin - Spot prices from Coinbase

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use once_cell::sync::{Lazy, OnceCell};
use regex_lite::Captures;
use serde::Deserialize;

use crate::application::errors::{ConfigError, PluginError};
use crate::application::messaging::{CommandContext, CommandTable, Reply};
use crate::domain::entities::Incoming;
use crate::infrastructure::plugins::{KeywordKind, KeywordSpec, Keywords, PluginSpec};
use super::trait_def::{Agent, Plugin, PluginContext};

const DEFAULT_API_BASE: &str = "https://api.coinbase.com/v2";
const API_VERSION: &str = "2017-12-01";
const FALLBACK_REPLY: &str = "I dunno, probably like a billion in your monopoly money";

const KEYWORDS: &[KeywordSpec] = &[KeywordSpec::optional("api_base", KeywordKind::Str)];

pub const SPEC: PluginSpec = PluginSpec {
    type_name: "plugins.coinbase.CoinPrice",
    summary: "Answers `btc`, `eth usd` and friends with the current spot price",
    keywords: KEYWORDS,
    factory: build,
};

static COMMANDS: Lazy<CommandTable<CoinPrice>> = Lazy::new(|| {
    CommandTable::new().command(r"(btc|eth|ltc|bch)(?:\s+(\w+))?", CoinPrice::price_command)
});

/// A quoted price, as returned by the exchange
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Price {
    pub amount: String,
    pub currency: String,
}

impl Price {
    fn value(&self) -> Result<f64, PluginError> {
        self.amount
            .parse()
            .map_err(|_| PluginError::External(format!("unparseable amount \"{}\"", self.amount)))
    }
}

/// Where prices come from
pub trait PriceSource: Send + Sync {
    /// Spot price of `coin` in `currency`, today or on `date`
    fn spot(&self, coin: &str, currency: &str, date: Option<NaiveDate>) -> Result<Price, PluginError>;
}

#[derive(Deserialize)]
struct SpotResponse {
    data: Price,
}

/// Coinbase v2 public spot price endpoint
pub struct CoinbaseSource {
    api_base: String,
    client: OnceCell<reqwest::blocking::Client>,
}

impl CoinbaseSource {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, PluginError> {
        self.client.get_or_try_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| PluginError::External(e.to_string()))
        })
    }
}

impl PriceSource for CoinbaseSource {
    fn spot(&self, coin: &str, currency: &str, date: Option<NaiveDate>) -> Result<Price, PluginError> {
        let url = format!("{}/prices/{}-{}/spot", self.api_base, coin, currency);
        let mut request = self.client()?.get(&url).header("CB-VERSION", API_VERSION);
        if let Some(date) = date {
            request = request.query(&[("date", date.format("%Y-%m-%d").to_string())]);
        }

        let response: SpotResponse = request
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| PluginError::External(e.to_string()))?;
        Ok(response.data)
    }
}

pub struct CoinPrice {
    agent: Agent,
    source: Box<dyn PriceSource>,
}

impl CoinPrice {
    pub fn new(ctx: &PluginContext, source: Box<dyn PriceSource>) -> Self {
        Self {
            agent: Agent::new(ctx),
            source,
        }
    }

    fn price_command(&self, ctx: &CommandContext<'_>, caps: &Captures<'_>) -> Result<(), PluginError> {
        let coin = caps[1].to_uppercase();
        let currency = caps
            .get(2)
            .map(|m| m.as_str().to_uppercase())
            .unwrap_or_else(|| "USD".to_string());

        match self.quote(&coin, &currency) {
            Ok(msg) => ctx.reply.send(msg),
            Err(e) => {
                self.agent.warn(format_args!("price lookup for {}-{} failed: {}", coin, currency, e));
                ctx.reply.send(FALLBACK_REPLY);
            }
        }
        Ok(())
    }

    fn quote(&self, coin: &str, currency: &str) -> Result<String, PluginError> {
        let yesterday = Utc::now().date_naive().checked_sub_days(Days::new(1));
        let current = self.source.spot(coin, currency, None)?;
        let previous = self.source.spot(coin, currency, yesterday)?;

        let mut msg = format!("Current {} price is {} {}", coin, current.amount, current.currency);
        let prev = previous.value()?;
        if prev > 1.0 {
            let direction = if prev < current.value()? { "UP" } else { "DOWN" };
            msg.push_str(&format!(", {} from {} yesterday", direction, previous.amount));
        } else {
            self.agent.warn("got zero price for yesterday");
        }
        Ok(msg)
    }
}

impl Plugin for CoinPrice {
    fn agent(&self) -> &Agent {
        &self.agent
    }

    fn handle_incoming(&self, incoming: &Incoming, reply: &Reply) -> Result<(), PluginError> {
        COMMANDS.dispatch(self, incoming, reply).map(|_| ())
    }
}

fn build(ctx: PluginContext, keywords: &Keywords) -> Result<Arc<dyn Plugin>, ConfigError> {
    COMMANDS.validate()?;
    let api_base = keywords.str("api_base").unwrap_or(DEFAULT_API_BASE);
    Ok(Arc::new(CoinPrice::new(&ctx, Box::new(CoinbaseSource::new(api_base)))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Outgoing;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Returns `today` for current prices and `yesterday` for dated ones
    struct FixedSource {
        today: &'static str,
        yesterday: &'static str,
        requests: Mutex<Vec<String>>,
    }

    impl PriceSource for FixedSource {
        fn spot(&self, coin: &str, currency: &str, date: Option<NaiveDate>) -> Result<Price, PluginError> {
            self.requests.lock().unwrap().push(format!("{}-{}", coin, currency));
            let amount = if date.is_some() { self.yesterday } else { self.today };
            Ok(Price {
                amount: amount.to_string(),
                currency: currency.to_string(),
            })
        }
    }

    struct DownSource;

    impl PriceSource for DownSource {
        fn spot(&self, _coin: &str, _currency: &str, _date: Option<NaiveDate>) -> Result<Price, PluginError> {
            Err(PluginError::External("connection refused".into()))
        }
    }

    fn ask(plugin: &CoinPrice, text: &str) -> Option<Outgoing> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        plugin
            .handle_incoming(&Incoming::new("default", text, "alice", false), &Reply::new("default", tx))
            .unwrap();
        rx.try_recv().ok()
    }

    fn plugin(source: impl PriceSource + 'static) -> CoinPrice {
        CoinPrice::new(&PluginContext::detached(SPEC.type_name), Box::new(source))
    }

    #[test]
    fn reports_direction_against_yesterday() {
        let source = FixedSource {
            today: "4100.50",
            yesterday: "3900.00",
            requests: Mutex::new(Vec::new()),
        };
        let plugin = plugin(source);

        let out = ask(&plugin, "btc").unwrap();
        assert_eq!(out.text, "Current BTC price is 4100.50 USD, UP from 3900.00 yesterday");
    }

    #[test]
    fn currency_is_optional_second_word() {
        let plugin = plugin(FixedSource {
            today: "200",
            yesterday: "250",
            requests: Mutex::new(Vec::new()),
        });

        let out = ask(&plugin, "eth eur").unwrap();
        assert_eq!(out.text, "Current ETH price is 200 EUR, DOWN from 250 yesterday");
    }

    #[test]
    fn zero_yesterday_omits_direction() {
        let plugin = plugin(FixedSource {
            today: "61.2",
            yesterday: "0.00",
            requests: Mutex::new(Vec::new()),
        });

        assert_eq!(ask(&plugin, "ltc").unwrap().text, "Current LTC price is 61.2 USD");
    }

    #[test]
    fn lookup_failure_falls_back_to_joke() {
        let plugin = plugin(DownSource);
        assert_eq!(ask(&plugin, "bch").unwrap().text, FALLBACK_REPLY);
    }

    #[test]
    fn ignores_other_text() {
        let plugin = plugin(DownSource);
        assert!(ask(&plugin, "doge").is_none());
        assert!(ask(&plugin, "what is btc at").is_none());
    }

    #[test]
    fn command_table_compiles() {
        assert!(COMMANDS.validate().is_ok());
        assert_eq!(COMMANDS.len(), 1);
    }
}
