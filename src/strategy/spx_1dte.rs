// =============================================================================
// SPX 1DTE Bull Put Spread (C8.4.8.4)
// =============================================================================
//
// Bullish-only credit spread with a trend filter over ES futures layered on
// top of the §4.8.3 range-breakout/exit skeleton. Positions may carry
// overnight; a daily reset must never clobber an open position's tracked
// state.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Timelike;
use parking_lot::RwLock;
use tracing::warn;

use crate::broker::client::BrokerClient;
use crate::greeks;
use crate::indicators::ema::calculate_ema;
use crate::indicators::sma::latest_sma;
use crate::indicators::vwma::latest_vwma;
use crate::option_search::{OptionSearchEngine, SearchParams, SearchTarget};
use crate::strategy::{StrategyCore, StrategyHandler};
use crate::types::{Bar, Order, OrderSide, OrderStatus, OrderType, OptionKind};

const DAILY_WINDOW: usize = 30;
const MINUTE_WINDOW: usize = 60;

#[derive(Debug, Clone)]
pub struct Spx1dteConfig {
    pub short_delta: f64,
    pub long_delta: f64,
    pub sl_pct_of_credit: f64,
    pub tp_pct_of_credit: f64,
    pub order_size: f64,
    pub require_strong_reclaim: bool,
    pub require_two_day_confirmation: bool,
    pub macro_event_dates: HashSet<chrono::NaiveDate>,
    pub block_day_before_macro_event: bool,
}

#[derive(Debug, Default, Clone)]
struct TrendState {
    daily_closes: Vec<f64>,
    daily_volumes: Vec<f64>,
    daily_opens: Vec<f64>,
    minute_closes: Vec<f64>,
    strong_reclaim: bool,
    two_day_confirmed: bool,
}

struct OpenPosition {
    entry_credit: f64,
    short_leg: String,
    long_leg: String,
    sl_price: f64,
    tp_price: f64,
    parent_order_id: String,
    tracked_limit: Option<f64>,
}

pub struct Spx1dteStrategy<B: BrokerClient> {
    config: Spx1dteConfig,
    es_instrument_id: String,
    broker: Arc<B>,
    search: Arc<OptionSearchEngine<B>>,
    trend: RwLock<TrendState>,
    open_position: RwLock<Option<OpenPosition>>,
    entry_in_progress: RwLock<bool>,
}

impl<B: BrokerClient + 'static> Spx1dteStrategy<B> {
    pub fn new(config: Spx1dteConfig, es_instrument_id: impl Into<String>, broker: Arc<B>, search: Arc<OptionSearchEngine<B>>) -> Self {
        Self {
            config,
            es_instrument_id: es_instrument_id.into(),
            broker,
            search,
            trend: RwLock::new(TrendState::default()),
            open_position: RwLock::new(None),
            entry_in_progress: RwLock::new(false),
        }
    }

    fn on_daily_bar(&self, bar: &Bar) {
        let mut trend = self.trend.write();
        let prior_close = trend.daily_closes.last().copied();
        let prior_open = trend.daily_opens.last().copied();
        trend.daily_closes.push(bar.close);
        trend.daily_volumes.push(bar.volume);
        trend.daily_opens.push(bar.open);
        if trend.daily_closes.len() > DAILY_WINDOW {
            trend.daily_closes.remove(0);
            trend.daily_volumes.remove(0);
            trend.daily_opens.remove(0);
        }

        let ema20 = calculate_ema(&trend.daily_closes, 20).last().copied();
        if let (Some(prior_close), Some(prior_open), Some(ema20)) = (prior_close, prior_open, ema20) {
            trend.strong_reclaim = prior_close > ema20 && prior_close > prior_open;
        }
        if trend.daily_closes.len() >= 2 {
            let n = trend.daily_closes.len();
            if let Some(ema20) = ema20 {
                trend.two_day_confirmed = trend.daily_closes[n - 1] > ema20 && trend.daily_closes[n - 2] > ema20;
            }
        }
    }

    fn on_minute_bar(&self, bar: &Bar) {
        let mut trend = self.trend.write();
        trend.minute_closes.push(bar.close);
        if trend.minute_closes.len() > MINUTE_WINDOW {
            trend.minute_closes.remove(0);
        }
    }

    fn trend_filter_passes(&self, es_price: f64) -> bool {
        let trend = self.trend.read();
        let Some(ema20) = calculate_ema(&trend.daily_closes, 20).last().copied() else {
            return false;
        };
        let Some(vwma14) = latest_vwma(&trend.daily_closes, &trend.daily_volumes, 14) else {
            return false;
        };
        let Some(sma10_min) = latest_sma(&trend.minute_closes, 10) else {
            return false;
        };
        if es_price <= ema20 || es_price <= vwma14 || es_price <= sma10_min {
            return false;
        }
        if self.config.require_strong_reclaim && !trend.strong_reclaim {
            return false;
        }
        if self.config.require_two_day_confirmation && !trend.two_day_confirmed {
            return false;
        }
        true
    }

    fn macro_event_blocks(&self, today: chrono::NaiveDate) -> bool {
        if self.config.macro_event_dates.contains(&today) {
            return true;
        }
        if self.config.block_day_before_macro_event {
            let tomorrow = today + chrono::Duration::days(1);
            if self.config.macro_event_dates.contains(&tomorrow) {
                return true;
            }
        }
        false
    }

    async fn try_enter(&self, core: &StrategyCore, now: chrono::DateTime<chrono::Utc>) {
        if core.recorder.has_active_trade() || *self.entry_in_progress.read() {
            return;
        }
        let today = now.with_timezone(&crate::clock::tz::EASTERN).date_naive();
        if self.macro_event_blocks(today) {
            return;
        }
        let Some(es_quote) = self.broker.last_quote(&self.es_instrument_id) else {
            return;
        };
        if !self.trend_filter_passes(es_quote.mid()) {
            return;
        }

        *self.entry_in_progress.write() = true;

        let short_params = SearchParams {
            target: SearchTarget::Delta(-self.config.short_delta),
            kind: OptionKind::Put,
            underlying: core.instrument_id.clone(),
            expiry: Some(today + chrono::Duration::days(1)),
            strike_range: 15,
            strike_step: 5.0,
            max_spread: 0.5,
            delay: std::time::Duration::from_secs(2),
            risk_free_rate: 0.04,
            dividend_yield: 0.015,
        };
        let long_params = SearchParams {
            target: SearchTarget::Delta(-self.config.long_delta),
            ..short_params.clone()
        };

        let short_result = self.search.find_option_sync(short_params).await;
        let long_result = self.search.find_option_sync(long_params).await;

        let (Some(short), Some(long)) = (short_result, long_result) else {
            warn!(strategy_id = %core.strategy_id, "1dte option search failed to find both legs");
            *self.entry_in_progress.write() = false;
            return;
        };

        let short_strike = parse_trailing_strike(&short.instrument_id);
        let long_strike = parse_trailing_strike(&long.instrument_id);
        if long_strike >= short_strike {
            warn!(strategy_id = %core.strategy_id, long_strike, short_strike, "long strike not below short strike, aborting entry");
            *self.entry_in_progress.write() = false;
            return;
        }

        let entry_credit = (short.mid - long.mid).max(0.0);
        let sl_price = -(entry_credit * self.config.sl_pct_of_credit / 100.0);
        let tp_price = -(entry_credit * self.config.tp_pct_of_credit / 100.0);

        let limit_price = -entry_credit;
        let parent_order_id = format!("{}-1dte-entry", core.strategy_id);
        let order = Order {
            client_order_id: parent_order_id.clone(),
            exchange_order_id: None,
            instrument_id: format!("{}/{}", short.instrument_id, long.instrument_id),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: self.config.order_size,
            limit_price: Some(limit_price),
            time_in_force: "DAY".into(),
            status: OrderStatus::Submitted,
            filled_qty: 0.0,
            avg_fill_price: None,
            commission: 0.0,
            submitted_at: now,
        };

        *self.open_position.write() = Some(OpenPosition {
            entry_credit,
            short_leg: short.instrument_id.clone(),
            long_leg: long.instrument_id.clone(),
            sl_price,
            tp_price,
            parent_order_id: parent_order_id.clone(),
            tracked_limit: Some(limit_price),
        });

        let trade_id = format!("{}-{}", core.strategy_id, now.timestamp_millis());
        let _ = core.recorder.start_trade(
            &core.trading_data,
            &trade_id,
            &core.instrument_id,
            Some("SPREAD"),
            -entry_credit,
            self.config.order_size,
            Some("CREDIT_PUT"),
            now,
        );

        let _ = core.submit_entry_order(order).await;
        *self.entry_in_progress.write() = false;
    }

    /// Resolves the exit fill price per the closing-order extraction rules:
    /// prefer the parent spread id over a `-LEG-` suffixed child id, prefer
    /// the tracked submission-time limit over a sane `avg_px`, and fall back
    /// to `last_px` only as a last resort.
    fn resolve_exit_fill_price(&self, fill_client_order_id: &str, avg_px: Option<f64>, last_px: f64) -> f64 {
        let parent_id = match fill_client_order_id.find("-LEG-") {
            Some(idx) => &fill_client_order_id[..idx],
            None => fill_client_order_id,
        };

        let open = self.open_position.read();
        if let Some(pos) = open.as_ref() {
            if pos.parent_order_id == parent_id {
                if let Some(limit) = pos.tracked_limit {
                    return limit;
                }
            }
        }
        if let Some(avg_px) = avg_px {
            if avg_px.abs() <= 5.0 {
                return avg_px;
            }
        }
        last_px
    }

    fn exit_reason_for(&self, fill_price: f64, sl_price: f64, tp_price: f64) -> &'static str {
        if fill_price <= sl_price {
            "STOP_LOSS"
        } else if fill_price >= tp_price {
            "TAKE_PROFIT"
        } else {
            "MANUAL"
        }
    }
}

fn parse_trailing_strike(instrument_id: &str) -> f64 {
    instrument_id
        .rsplit(' ')
        .next()
        .map(|s| s.trim_end_matches(['C', 'P']))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

#[async_trait]
impl<B: BrokerClient + 'static> StrategyHandler for Spx1dteStrategy<B> {
    async fn on_bar(&self, core: &StrategyCore, bar: &Bar) -> anyhow::Result<()> {
        if bar.instrument_id == self.es_instrument_id && bar.is_closed {
            if bar.period == "1D" {
                self.on_daily_bar(bar);
            } else if bar.period == "1m" {
                self.on_minute_bar(bar);
            }
        }

        if bar.instrument_id == self.es_instrument_id && bar.period == "1m" && bar.is_closed {
            let local_hour = bar.close_time.with_timezone(&crate::clock::tz::EASTERN).time().hour();
            if local_hour < 15 {
                self.try_enter(core, bar.close_time).await;
            }
        }

        let (Some(short_leg), Some(long_leg)) = ({
            let guard = self.open_position.read();
            (guard.as_ref().map(|p| p.short_leg.clone()), guard.as_ref().map(|p| p.long_leg.clone()))
        }) else {
            return Ok(());
        };
        if bar.instrument_id != short_leg && bar.instrument_id != long_leg {
            return Ok(());
        }
        let (Some(short_q), Some(long_q)) = (self.broker.last_quote(&short_leg), self.broker.last_quote(&long_leg)) else {
            return Ok(());
        };
        let mid = short_q.mid() - long_q.mid();
        let (sl_price, tp_price, entry_credit, order_size) = {
            let guard = self.open_position.read();
            let Some(pos) = guard.as_ref() else { return Ok(()) };
            (pos.sl_price, pos.tp_price, pos.entry_credit, self.config.order_size)
        };
        core.recorder.update_metrics(&core.trading_data, (entry_credit - mid) * 100.0);

        let close_legs = [
            (short_leg.clone(), order_size.round() as i32),
            (long_leg.clone(), -(order_size.round() as i32)),
        ];
        if mid <= sl_price && !*core.sl_triggered.read() {
            *core.sl_triggered.write() = true;
            let _ = core.close_spread_smart(&close_legs, Some(-sl_price)).await;
        } else if mid >= tp_price && !*core.closing_in_progress.read() {
            let _ = core.close_spread_smart(&close_legs, Some(-tp_price)).await;
        }
        Ok(())
    }

    async fn on_order_filled(&self, core: &StrategyCore, order: &Order, _fill_qty: f64, fill_price: f64) -> anyhow::Result<()> {
        let Some((sl_price, tp_price)) = self.open_position.read().as_ref().map(|p| (p.sl_price, p.tp_price)) else {
            return Ok(());
        };
        if order.client_order_id == self.open_position.read().as_ref().map(|p| p.parent_order_id.clone()).unwrap_or_default()
            && order.side == OrderSide::Sell
        {
            let resolved = self.resolve_exit_fill_price(&order.client_order_id, order.avg_fill_price, fill_price);
            let reason = self.exit_reason_for(resolved, sl_price, tp_price);
            let final_pnl_price = resolved;
            let _ = core.recorder.close_trade(&core.trading_data, final_pnl_price, reason, chrono::Utc::now(), order.commission);
            self.open_position.write().take();
        }
        Ok(())
    }
}
