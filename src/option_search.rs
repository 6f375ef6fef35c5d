// =============================================================================
// Option Search Engine (C6) — finds a single option leg whose premium or
// delta is closest to a target.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::broker::client::BrokerClient;
use crate::clock::Clock;
use crate::greeks;
use crate::types::OptionKind;

#[derive(Debug, Clone, Copy)]
pub enum SearchTarget {
    Premium(f64),
    Delta(f64),
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub target: SearchTarget,
    pub kind: OptionKind,
    pub underlying: String,
    pub expiry: Option<chrono::NaiveDate>,
    pub strike_range: u32,
    pub strike_step: f64,
    pub max_spread: f64,
    pub delay: std::time::Duration,
    pub risk_free_rate: f64,
    pub dividend_yield: f64,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub instrument_id: String,
    pub mid: f64,
    pub bid: f64,
    pub ask: f64,
    pub delta: Option<f64>,
}

struct InFlightSearch {
    candidates: Vec<String>,
    cancelled: bool,
}

pub struct OptionSearchEngine<B: BrokerClient> {
    broker: Arc<B>,
    clock: Arc<Clock>,
    searches: Mutex<HashMap<String, InFlightSearch>>,
}

impl<B: BrokerClient + 'static> OptionSearchEngine<B> {
    pub fn new(broker: Arc<B>, clock: Arc<Clock>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            clock,
            searches: Mutex::new(HashMap::new()),
        })
    }

    /// Enumerates a strike window around the current ATM strike, subscribes
    /// to every candidate, then resolves after `params.delay` to the single
    /// contract whose mid (or delta) is closest to the target. The result is
    /// delivered through the returned one-shot receiver rather than a loose
    /// callback, so a caller gets a single, explicitly awaitable resolution
    /// and can drop the receiver to stop caring about the outcome without
    /// affecting the search itself (use [`Self::cancel`] to also stop it).
    #[instrument(skip(self))]
    pub async fn find_option(self: &Arc<Self>, params: SearchParams) -> (String, tokio::sync::oneshot::Receiver<Option<SearchResult>>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let search_id = Uuid::new_v4().to_string();
        let underlying_price = self
            .broker
            .last_quote(&params.underlying)
            .map(|q| q.mid())
            .unwrap_or(0.0);

        let atm_strike = (underlying_price / params.strike_step).round() * params.strike_step;
        let mut candidates = Vec::new();
        let range = params.strike_range as i64;
        for n in -range..=range {
            let strike = atm_strike + n as f64 * params.strike_step;
            let suffix = match params.kind {
                OptionKind::Call => "C",
                OptionKind::Put => "P",
            };
            let instrument_id = format!("{} {}{}", params.underlying, strike, suffix);
            self.broker.request_instrument(&instrument_id).await;
            self.broker.subscribe_quotes(&instrument_id).await;
            candidates.push(instrument_id);
        }

        self.searches.lock().insert(
            search_id.clone(),
            InFlightSearch {
                candidates: candidates.clone(),
                cancelled: false,
            },
        );

        let engine = self.clone();
        let id_for_alert = search_id.clone();
        let resolve_at = self.clock.now() + chrono::Duration::from_std(params.delay).unwrap_or_default();
        self.clock.set_alert(format!("option-search-{search_id}"), resolve_at, move || {
            let engine = engine.clone();
            let id = id_for_alert;
            async move {
                let result = engine.resolve(&id, &params).await;
                let _ = tx.send(result);
            }
        });

        (search_id, rx)
    }

    /// Same enumeration/delay/resolve flow as [`Self::find_option`], but
    /// awaited directly instead of driven through a named clock alert and
    /// callback — used by strategies that need both legs of a spread before
    /// proceeding rather than reacting to a later callback.
    pub async fn find_option_sync(self: &Arc<Self>, params: SearchParams) -> Option<SearchResult> {
        let search_id = Uuid::new_v4().to_string();
        let underlying_price = self
            .broker
            .last_quote(&params.underlying)
            .map(|q| q.mid())
            .unwrap_or(0.0);

        let atm_strike = (underlying_price / params.strike_step).round() * params.strike_step;
        let mut candidates = Vec::new();
        let range = params.strike_range as i64;
        for n in -range..=range {
            let strike = atm_strike + n as f64 * params.strike_step;
            let suffix = match params.kind {
                OptionKind::Call => "C",
                OptionKind::Put => "P",
            };
            let instrument_id = format!("{} {}{}", params.underlying, strike, suffix);
            self.broker.request_instrument(&instrument_id).await;
            self.broker.subscribe_quotes(&instrument_id).await;
            candidates.push(instrument_id);
        }
        self.searches.lock().insert(search_id.clone(), InFlightSearch { candidates, cancelled: false });

        tokio::time::sleep(params.delay).await;
        self.resolve(&search_id, &params).await
    }

    async fn resolve(self: &Arc<Self>, search_id: &str, params: &SearchParams) -> Option<SearchResult> {
        let state = self.searches.lock().remove(search_id)?;
        if state.cancelled {
            return None;
        }

        let underlying_price = self.broker.last_quote(&params.underlying).map(|q| q.mid()).unwrap_or(0.0);
        let mut best: Option<SearchResult> = None;
        let mut best_diff = f64::INFINITY;

        for instrument_id in &state.candidates {
            let Some(quote) = self.broker.last_quote(instrument_id) else {
                self.broker.unsubscribe_quotes(instrument_id).await;
                continue;
            };
            if !quote.is_valid() || quote.spread() > params.max_spread {
                self.broker.unsubscribe_quotes(instrument_id).await;
                continue;
            }

            let mid = quote.mid();
            let (score, computed_delta) = match params.target {
                SearchTarget::Premium(target) => ((mid - target).abs(), None),
                SearchTarget::Delta(target) => {
                    let strike = self.parse_strike(instrument_id, &params.underlying);
                    let iv = greeks::implied_volatility(
                        mid,
                        underlying_price,
                        strike,
                        params.risk_free_rate,
                        params.dividend_yield,
                        self.time_to_expiry(params.expiry),
                        to_greeks_kind(params.kind),
                    );
                    let d = greeks::delta(
                        underlying_price,
                        strike,
                        params.risk_free_rate,
                        params.dividend_yield,
                        iv,
                        self.time_to_expiry(params.expiry),
                        to_greeks_kind(params.kind),
                    );
                    ((d.abs() - target.abs()).abs(), Some(d))
                }
            };

            if score < best_diff {
                if let Some(prev) = &best {
                    self.broker.unsubscribe_quotes(&prev.instrument_id).await;
                }
                best_diff = score;
                best = Some(SearchResult {
                    instrument_id: instrument_id.clone(),
                    mid,
                    bid: quote.bid,
                    ask: quote.ask,
                    delta: computed_delta,
                });
            } else {
                self.broker.unsubscribe_quotes(instrument_id).await;
            }
        }

        if best.is_none() {
            info!(search_id, "option search found no valid candidate");
        }
        best
    }

    /// Cancels a search before its delay-alert fires. The alert is the only
    /// path that normally unsubscribes losing candidates, so cancelling it
    /// here means this call must drain the candidate list and unsubscribe
    /// every one itself rather than leaving that to a `resolve()` that will
    /// now never run.
    pub async fn cancel(&self, search_id: &str) {
        self.clock.cancel(&format!("option-search-{search_id}"));
        let Some(state) = self.searches.lock().remove(search_id) else {
            return;
        };
        for instrument_id in &state.candidates {
            self.broker.unsubscribe_quotes(instrument_id).await;
        }
    }

    fn time_to_expiry(&self, expiry: Option<chrono::NaiveDate>) -> f64 {
        let today = self.clock.now().date_naive();
        match expiry {
            Some(e) => ((e - today).num_days().max(0) as f64 / 365.0).max(1.0 / 365.0),
            None => 1.0 / 365.0,
        }
    }

    fn parse_strike(&self, instrument_id: &str, underlying: &str) -> f64 {
        instrument_id
            .trim_start_matches(underlying)
            .trim()
            .trim_end_matches(['C', 'P'])
            .parse()
            .unwrap_or(0.0)
    }
}

fn to_greeks_kind(kind: OptionKind) -> greeks::OptionKind {
    match kind {
        OptionKind::Call => greeks::OptionKind::Call,
        OptionKind::Put => greeks::OptionKind::Put,
    }
}
