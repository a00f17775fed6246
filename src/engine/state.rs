use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::api::ExchangeApi;
use crate::config::EngineConfig;
use crate::models::{Order, OrderStatus, OrderUpdate, Position, Side, Trade, TradeStatus};

/// Where the single buy-then-sell cycle currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingState {
    ReadyToBuy,
    Buying,
    ReadyToSell,
    Selling,
}

impl TradingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingState::ReadyToBuy => "READY_TO_BUY",
            TradingState::Buying => "BUYING",
            TradingState::ReadyToSell => "READY_TO_SELL",
            TradingState::Selling => "SELLING",
        }
    }
}

impl std::fmt::Display for TradingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: TradingState, to: TradingState },

    #[error("insufficient {asset} balance: required {required:.4}, available {available:.4}")]
    InsufficientBalance {
        asset: String,
        required: f64,
        available: f64,
    },

    #[error("no open position to sell")]
    NoPosition,

    #[error("quantity {quantity} below exchange minimum {minimum}")]
    BelowMinimumQuantity { quantity: f64, minimum: f64 },
}

/// Rolling account of completed cycles
#[derive(Debug, Clone)]
pub struct TradingSummary {
    pub state: TradingState,
    pub position: Option<Position>,
    pub total_trades: usize,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub total_profit_loss: f64,
}

#[derive(Debug)]
struct StateInner {
    state: TradingState,
    position: Option<Position>,
    active_order: Option<Order>,
    trades: Vec<Trade>,
}

/// Drives the buy/sell cycle for one pair and owns the trade ledger
///
/// Exactly one order is in flight at any time. All mutation funnels through
/// `transition` and `handle_order_update`, so replayed or stale updates
/// cannot move the machine twice.
pub struct StateManager {
    symbol: String,
    quote_asset: String,
    api: Arc<dyn ExchangeApi>,
    fee_rate: f64,
    lot_step: f64,
    min_quantity: f64,
    inner: Mutex<StateInner>,
}

/// The only legal moves; everything else is rejected
fn is_valid_transition(from: TradingState, to: TradingState) -> bool {
    use TradingState::*;
    matches!(
        (from, to),
        (ReadyToBuy, Buying)
            | (Buying, ReadyToSell)
            | (Buying, ReadyToBuy)
            | (ReadyToSell, Selling)
            | (Selling, ReadyToBuy)
            | (Selling, ReadyToSell)
    )
}

/// Truncate (never round up) to the exchange lot step
///
/// The epsilon absorbs float noise like 0.256/0.001 landing at 255.999...
pub fn truncate_to_step(quantity: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return quantity;
    }
    ((quantity / step) + 1e-9).floor() * step
}

fn profit_loss(buy: &Order, sell: &Order, fee_rate: f64) -> f64 {
    let buy_value = buy.quantity * buy.price;
    let sell_value = sell.quantity * sell.price;
    sell_value - buy_value - fee_rate * (buy_value + sell_value)
}

impl StateManager {
    pub fn new(
        symbol: impl Into<String>,
        api: Arc<dyn ExchangeApi>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            quote_asset: config.quote_asset.clone(),
            api,
            fee_rate: config.fee_rate,
            lot_step: config.lot_step,
            min_quantity: config.min_quantity,
            inner: Mutex::new(StateInner {
                state: TradingState::ReadyToBuy,
                position: None,
                active_order: None,
                trades: Vec::new(),
            }),
        }
    }

    pub async fn state(&self) -> TradingState {
        self.inner.lock().await.state
    }

    pub async fn position(&self) -> Option<Position> {
        self.inner.lock().await.position.clone()
    }

    pub async fn active_order(&self) -> Option<Order> {
        self.inner.lock().await.active_order.clone()
    }

    fn apply_transition(inner: &mut StateInner, to: TradingState) -> Result<(), TradeError> {
        let from = inner.state;
        if !is_valid_transition(from, to) {
            tracing::error!("Rejected state transition: {from} -> {to}");
            return Err(TradeError::InvalidTransition { from, to });
        }
        inner.state = to;
        tracing::info!("State transition: {from} -> {to}");
        Ok(())
    }

    /// Place a limit buy, record the open trade and move to BUYING
    pub async fn place_buy_order(&self, price: f64, quantity: f64) -> Result<Order> {
        {
            let inner = self.inner.lock().await;
            if inner.state != TradingState::ReadyToBuy {
                return Err(TradeError::InvalidTransition {
                    from: inner.state,
                    to: TradingState::Buying,
                }
                .into());
            }
        }

        let quantity = truncate_to_step(quantity, self.lot_step);
        if quantity < self.min_quantity {
            return Err(TradeError::BelowMinimumQuantity {
                quantity,
                minimum: self.min_quantity,
            }
            .into());
        }

        let available = self.api.get_available_balance(&self.quote_asset).await?;
        let required = price * quantity;
        if available < required {
            return Err(TradeError::InsufficientBalance {
                asset: self.quote_asset.clone(),
                required,
                available,
            }
            .into());
        }

        let order = self
            .api
            .place_order(&self.symbol, Side::Buy, quantity, price)
            .await?;

        let mut inner = self.inner.lock().await;
        // The lock was dropped across the exchange call, so a concurrent
        // caller may have won the race. Transition before touching the
        // ledger: a rejected transition must leave no trace.
        if let Err(e) = Self::apply_transition(&mut inner, TradingState::Buying) {
            tracing::warn!(
                "Buy order {} lost a state race, ledger left untouched",
                order.id
            );
            return Err(e.into());
        }
        inner.trades.push(Trade {
            buy_order: order.clone(),
            sell_order: None,
            profit_loss: None,
            status: TradeStatus::Open,
            timestamp: Utc::now(),
        });
        inner.active_order = Some(order.clone());

        Ok(order)
    }

    /// Place a limit sell against the open position and move to SELLING
    pub async fn place_sell_order(&self, price: f64, quantity: f64) -> Result<Order> {
        let position_quantity = {
            let inner = self.inner.lock().await;
            if inner.state != TradingState::ReadyToSell {
                return Err(TradeError::InvalidTransition {
                    from: inner.state,
                    to: TradingState::Selling,
                }
                .into());
            }
            inner.position.as_ref().ok_or(TradeError::NoPosition)?.quantity
        };

        // Never sell more than we hold
        let quantity = truncate_to_step(quantity.min(position_quantity), self.lot_step);
        if quantity < self.min_quantity {
            return Err(TradeError::BelowMinimumQuantity {
                quantity,
                minimum: self.min_quantity,
            }
            .into());
        }

        let order = self
            .api
            .place_order(&self.symbol, Side::Sell, quantity, price)
            .await?;

        let mut inner = self.inner.lock().await;
        if let Err(e) = Self::apply_transition(&mut inner, TradingState::Selling) {
            tracing::warn!(
                "Sell order {} lost a state race, ledger left untouched",
                order.id
            );
            return Err(e.into());
        }
        // Attach the sell leg to the open ledger entry so a fill can be
        // matched even if the active order slot was lost in between
        if let Some(trade) = inner
            .trades
            .iter_mut()
            .rev()
            .find(|t| t.status == TradeStatus::Open)
        {
            trade.sell_order = Some(order.clone());
        }
        inner.active_order = Some(order.clone());

        Ok(order)
    }

    /// Fold an order status update into the machine
    ///
    /// Updates for unknown or already-settled orders are ignored, so this is
    /// safe to call with duplicates.
    pub async fn handle_order_update(&self, update: &OrderUpdate) {
        let mut inner = self.inner.lock().await;

        let Some(active) = inner
            .active_order
            .clone()
            .filter(|o| o.id == update.order_id)
        else {
            // Recovery path: the active slot was lost (restart, stale update)
            // but the ledger may still carry this id as an open sell leg
            self.settle_ledger_sell(&mut inner, update);
            return;
        };

        match update.status {
            OrderStatus::Filled => match inner.state {
                TradingState::Buying => {
                    let quantity = if update.filled_quantity > 0.0 {
                        update.filled_quantity
                    } else {
                        active.quantity
                    };
                    let entry_price = if update.filled_price > 0.0 {
                        update.filled_price
                    } else {
                        active.price
                    };
                    inner.position = Some(Position {
                        symbol: self.symbol.clone(),
                        quantity,
                        entry_price,
                        opened_at: Utc::now(),
                    });
                    inner.active_order = None;
                    let _ = Self::apply_transition(&mut inner, TradingState::ReadyToSell);
                    tracing::info!(
                        "Buy filled: {} {} @ {}",
                        quantity,
                        self.symbol,
                        entry_price
                    );
                }
                TradingState::Selling => {
                    let mut sell = active;
                    if update.filled_quantity > 0.0 {
                        sell.quantity = update.filled_quantity;
                    }
                    if update.filled_price > 0.0 {
                        sell.price = update.filled_price;
                    }
                    sell.status = OrderStatus::Filled;

                    let fee_rate = self.fee_rate;
                    if let Some(trade) = inner
                        .trades
                        .iter_mut()
                        .rev()
                        .find(|t| t.status == TradeStatus::Open)
                    {
                        let pnl = profit_loss(&trade.buy_order, &sell, fee_rate);
                        trade.sell_order = Some(sell.clone());
                        trade.profit_loss = Some(pnl);
                        trade.status = TradeStatus::Closed;
                        tracing::info!(
                            "Sell filled: {} {} @ {}, P&L {:.4} {}",
                            sell.quantity,
                            self.symbol,
                            sell.price,
                            pnl,
                            self.quote_asset
                        );
                    }

                    inner.position = None;
                    inner.active_order = None;
                    let _ = Self::apply_transition(&mut inner, TradingState::ReadyToBuy);
                }
                other => {
                    tracing::warn!("Fill received in state {other}, ignoring");
                }
            },
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired => {
                match inner.state {
                    TradingState::Buying => {
                        // Drop the trade opened for this buy; it never happened
                        if let Some(last) = inner.trades.last() {
                            if last.status == TradeStatus::Open
                                && last.buy_order.id == update.order_id
                            {
                                inner.trades.pop();
                            }
                        }
                        inner.active_order = None;
                        let _ = Self::apply_transition(&mut inner, TradingState::ReadyToBuy);
                        tracing::warn!("Buy order {} {:?}", update.order_id, update.status);
                    }
                    TradingState::Selling => {
                        // Detach the dead sell leg so a retry can replace it
                        if let Some(trade) = inner
                            .trades
                            .iter_mut()
                            .rev()
                            .find(|t| t.status == TradeStatus::Open)
                        {
                            trade.sell_order = None;
                        }
                        inner.active_order = None;
                        let _ = Self::apply_transition(&mut inner, TradingState::ReadyToSell);
                        tracing::warn!("Sell order {} {:?}", update.order_id, update.status);
                    }
                    other => {
                        tracing::warn!("Failure update in state {other}, ignoring");
                    }
                }
            }
            OrderStatus::New | OrderStatus::PartiallyFilled => {
                tracing::debug!(
                    order_id = %update.order_id,
                    status = ?update.status,
                    filled = update.filled_quantity,
                    "Order still working"
                );
            }
        }
    }

    /// Close an open ledger trade whose recorded sell leg matches the update
    ///
    /// Covers fills arriving after the active-order slot was lost. Updates
    /// that match nothing are dropped.
    fn settle_ledger_sell(&self, inner: &mut StateInner, update: &OrderUpdate) {
        if update.status != OrderStatus::Filled {
            tracing::debug!(
                order_id = %update.order_id,
                status = ?update.status,
                "Order update matches no active order, ignoring"
            );
            return;
        }

        let fee_rate = self.fee_rate;
        let Some(trade) = inner.trades.iter_mut().find(|t| {
            t.status == TradeStatus::Open
                && t.sell_order
                    .as_ref()
                    .is_some_and(|o| o.id == update.order_id)
        }) else {
            tracing::debug!(order_id = %update.order_id, "Fill matches no open sell leg, ignoring");
            return;
        };

        let mut sell = trade.sell_order.clone().expect("matched on sell leg");
        if update.filled_quantity > 0.0 {
            sell.quantity = update.filled_quantity;
        }
        if update.filled_price > 0.0 {
            sell.price = update.filled_price;
        }
        sell.status = OrderStatus::Filled;

        let pnl = profit_loss(&trade.buy_order, &sell, fee_rate);
        trade.sell_order = Some(sell);
        trade.profit_loss = Some(pnl);
        trade.status = TradeStatus::Closed;
        tracing::info!(
            "Recovered sell fill for order {}, P&L {:.4} {}",
            update.order_id,
            pnl,
            self.quote_asset
        );

        inner.position = None;
        if inner.state == TradingState::Selling {
            let _ = Self::apply_transition(inner, TradingState::ReadyToBuy);
        }
    }

    #[cfg(test)]
    async fn force_clear_active_order(&self) {
        self.inner.lock().await.active_order = None;
    }

    pub async fn trading_summary(&self) -> TradingSummary {
        let inner = self.inner.lock().await;
        let closed: Vec<&Trade> = inner
            .trades
            .iter()
            .filter(|t| t.status == TradeStatus::Closed)
            .collect();

        TradingSummary {
            state: inner.state,
            position: inner.position.clone(),
            total_trades: inner.trades.len(),
            closed_trades: closed.len(),
            winning_trades: closed
                .iter()
                .filter(|t| t.profit_loss.unwrap_or(0.0) > 0.0)
                .count(),
            total_profit_loss: closed.iter().filter_map(|t| t.profit_loss).sum(),
        }
    }

    pub async fn trades(&self) -> Vec<Trade> {
        self.inner.lock().await.trades.clone()
    }
}
