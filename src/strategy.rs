// ===============================
// src/strategy.rs
// ===============================
//
// Mean-reversion signal on a rolling window of mid prices.
//
//   z = (price - mean) / stddev       (population stddev, window includes price)
//   z < -band_k  -> long   (expect reversion upward)
//   z >  band_k  -> short
//   otherwise    -> flat
//   strength = min(1, |z| / saturation_z)
//
// Optional RSI confirmation (Wilder smoothing): a long also needs RSI below
// `rsi_oversold`, a short RSI above `rsi_overbought`. `rsi_period = 0` turns it off.
//
// Optional ADX regime filter: entries are vetoed while ADX >= `adx_max`
// (trending market). Each tick is treated as a bar with high = low = close, so
// the true range is |Δprice| and the ADX measures how one-sided recent moves were.
// `adx_period = 0` turns it off.
//
// ATR over the same tick bars is kept for stop placement (`atr()`).
//
// Nothing is emitted until the window (and RSI/ADX, if enabled) is warm.
//

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::domain::{Direction, Signal, Tick};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalParams {
    pub window: usize,
    pub band_k: f64,
    pub saturation_z: f64,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub atr_period: usize,
    pub adx_period: usize,
    pub adx_max: f64,
}

impl Default for SignalParams {
    fn default() -> Self {
        Self {
            window: 20,
            band_k: 2.0,
            saturation_z: 3.0,
            rsi_period: 0,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            atr_period: 14,
            adx_period: 0,
            adx_max: 25.0,
        }
    }
}

pub struct SignalEngine {
    params: SignalParams,
    window: VecDeque<f64>,
    sum: f64,
    rsi: Option<Rsi>,
    atr: Option<Atr>,
    adx: Option<Adx>,
}

impl SignalEngine {
    pub fn new(params: SignalParams) -> Self {
        let rsi = (params.rsi_period > 0).then(|| Rsi::new(params.rsi_period));
        let atr = (params.atr_period > 0).then(|| Atr::new(params.atr_period));
        let adx = (params.adx_period > 0).then(|| Adx::new(params.adx_period));
        Self { window: VecDeque::with_capacity(params.window), sum: 0.0, rsi, atr, adx, params }
    }

    /// Average true range of recent ticks, once seeded.
    pub fn atr(&self) -> Option<f64> { self.atr.as_ref().and_then(|a| a.tr.value()) }

    pub fn is_warm(&self) -> bool { self.window.len() >= self.params.window }

    pub fn on_tick(&mut self, tick: &Tick) -> Option<Signal> {
        let px = tick.mid();
        if !px.is_finite() || px <= 0.0 {
            return None;
        }

        if self.window.len() == self.params.window {
            if let Some(x) = self.window.pop_front() { self.sum -= x; }
        }
        self.window.push_back(px);
        self.sum += px;
        let rsi = self.rsi.as_mut().and_then(|r| r.update(px));
        if let Some(a) = self.atr.as_mut() {
            a.update(px);
        }
        let adx = self.adx.as_mut().and_then(|a| a.update(px));

        if !self.is_warm() || (self.rsi.is_some() && rsi.is_none()) || (self.adx.is_some() && adx.is_none()) {
            return None;
        }

        let n = self.window.len() as f64;
        let mean = self.sum / n;
        let var = self.window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let std = var.sqrt();
        let z = if std > f64::EPSILON * mean.abs().max(1.0) { (px - mean) / std } else { 0.0 };

        let mut direction = if z < -self.params.band_k {
            Direction::Long
        } else if z > self.params.band_k {
            Direction::Short
        } else {
            Direction::Flat
        };

        if let Some(r) = rsi {
            direction = match direction {
                Direction::Long if r >= self.params.rsi_oversold => Direction::Flat,
                Direction::Short if r <= self.params.rsi_overbought => Direction::Flat,
                d => d,
            };
        }
        if adx.map_or(false, |a| a >= self.params.adx_max) {
            direction = Direction::Flat;
        }

        let strength = if self.params.saturation_z > 0.0 { (z.abs() / self.params.saturation_z).min(1.0) } else { 1.0 };

        Some(Signal {
            ts_ms: tick.ts_ms,
            symbol: tick.symbol.clone(),
            direction,
            strength,
            basis_price: px,
            zscore: z,
            mean,
        })
    }
}

// Wilder RSI, seeded with the simple average of the first `period` changes.
struct Rsi {
    period: usize,
    prev: Option<f64>,
    count: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl Rsi {
    fn new(period: usize) -> Self {
        Self { period, prev: None, count: 0, avg_gain: 0.0, avg_loss: 0.0 }
    }

    fn update(&mut self, px: f64) -> Option<f64> {
        let prev = self.prev.replace(px)?;
        let diff = px - prev;
        let gain = diff.max(0.0);
        let loss = (-diff).max(0.0);
        let p = self.period as f64;

        if self.count < self.period {
            self.avg_gain += gain / p;
            self.avg_loss += loss / p;
            self.count += 1;
            if self.count < self.period {
                return None;
            }
        } else {
            self.avg_gain = (self.avg_gain * (p - 1.0) + gain) / p;
            self.avg_loss = (self.avg_loss * (p - 1.0) + loss) / p;
        }

        if self.avg_loss <= 0.0 {
            return Some(if self.avg_gain <= 0.0 { 50.0 } else { 100.0 });
        }
        Some(100.0 - 100.0 / (1.0 + self.avg_gain / self.avg_loss))
    }
}

/// Wilder smoothing, seeded with the simple mean of the first `period` samples.
struct Wilder {
    period: usize,
    count: usize,
    value: f64,
}

impl Wilder {
    fn new(period: usize) -> Self {
        Self { period, count: 0, value: 0.0 }
    }

    fn update(&mut self, x: f64) -> Option<f64> {
        let p = self.period as f64;
        if self.count < self.period {
            self.value += x / p;
            self.count += 1;
        } else {
            self.value = (self.value * (p - 1.0) + x) / p;
        }
        self.value()
    }

    fn value(&self) -> Option<f64> {
        (self.count >= self.period).then_some(self.value)
    }
}

struct Atr {
    prev: Option<f64>,
    tr: Wilder,
}

impl Atr {
    fn new(period: usize) -> Self {
        Self { prev: None, tr: Wilder::new(period) }
    }

    fn update(&mut self, px: f64) -> Option<f64> {
        let prev = self.prev.replace(px)?;
        self.tr.update((px - prev).abs())
    }
}

// +DM/-DM on close-only bars: exactly one of them carries the move.
struct Adx {
    prev: Option<f64>,
    tr: Wilder,
    plus: Wilder,
    minus: Wilder,
    dx: Wilder,
}

impl Adx {
    fn new(period: usize) -> Self {
        Self {
            prev: None,
            tr: Wilder::new(period),
            plus: Wilder::new(period),
            minus: Wilder::new(period),
            dx: Wilder::new(period),
        }
    }

    fn update(&mut self, px: f64) -> Option<f64> {
        let prev = self.prev.replace(px)?;
        let up = (px - prev).max(0.0);
        let down = (prev - px).max(0.0);
        let (Some(tr), Some(plus), Some(minus)) =
            (self.tr.update(up + down), self.plus.update(up), self.minus.update(down))
        else {
            return None;
        };
        let dx = if tr > 0.0 {
            let (pdi, mdi) = (100.0 * plus / tr, 100.0 * minus / tr);
            if pdi + mdi > 0.0 { 100.0 * (pdi - mdi).abs() / (pdi + mdi) } else { 0.0 }
        } else {
            0.0
        };
        self.dx.update(dx)
    }
}
