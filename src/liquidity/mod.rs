//! Liquidity scoring engine (C8, §4.8).

pub mod calculator;
pub mod calibration;
pub mod stats;

pub use calculator::{
    compute_liquidity_scores, DailyRecord, LiquidityParams, LiquidityScoreRow, LiquidityWeights,
    PenaltyKind, SymbolError, TickerSeries,
};
