//! End-to-end scenarios against the public engine API
//!
//! Leader BTC is pushed strongly bullish with every factor at +6, which
//! aggregates to +60. Dependents report enough factors to pass the
//! coverage floor.

use chrono::{DateTime, Duration, TimeZone, Utc};
use signal_engine::{
    CorrelationSkip, Direction, EngineConfig, EvaluationRequest, FactorId, FactorScore, SignalEngine,
};
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 30, 0).unwrap()
}

fn engine() -> SignalEngine {
    SignalEngine::new(EngineConfig::default()).unwrap()
}

fn scores(values: &[(FactorId, f64)]) -> Vec<FactorScore> {
    values.iter().map(|(id, v)| FactorScore::new(*id, *v)).collect()
}

fn strong_leader() -> Vec<FactorScore> {
    FactorId::ALL.iter().map(|id| FactorScore::new(*id, 6.0)).collect()
}

/// 16 factors reporting a faint +0.1: counted neutral, but they add coverage.
/// Together they add +0.43 to the raw score.
fn background() -> Vec<FactorScore> {
    use FactorId::*;
    [
        Rsi, Macd, StochRsi, Bollinger, Mfi, Cci, Adx, Vwap, PriceMomentum, TradesFlow, FearGreed,
        FundingRate, OpenInterest, LongShortRatio, ExchangeFlows, OrderBook,
    ]
    .iter()
    .map(|id| FactorScore::new(*id, 0.1))
    .collect()
}

/// Raw score of about -14.57 with two bearish factors
fn mildly_bearish() -> Vec<FactorScore> {
    let mut s = scores(&[(FactorId::Trend, -10.0), (FactorId::Momentum, -6.25)]);
    s.extend(background());
    s
}

/// Raw score of about -39.57 with five bearish factors
fn clearly_bearish() -> Vec<FactorScore> {
    let mut s = scores(&[
        (FactorId::Trend, -10.0),
        (FactorId::Momentum, -10.0),
        (FactorId::Whales, -10.0),
        (FactorId::Derivatives, -10.0),
        (FactorId::Sentiment, -10.0),
    ]);
    s.extend(background());
    s
}

#[tokio::test]
async fn test_scenario_a_empty_input_is_neutral_minimum() {
    let engine = engine();
    let result = engine
        .evaluate(EvaluationRequest::new("BTC", Vec::new(), t0()))
        .await;
    assert_eq!(result.raw_score, 0.0);
    assert_eq!(result.direction, Direction::Neutral);
    assert_eq!(result.probability, 50.0);
    assert_eq!(result.bullish_count, 0);
    assert_eq!(result.bearish_count, 0);
    assert!(result.conflict_note.is_none());
}

#[tokio::test]
async fn test_scenario_b_extreme_rsi_overrides_bullish_aggregate() {
    let engine = engine();
    let mut input = scores(&[
        (FactorId::Trend, 10.0),
        (FactorId::Momentum, 10.0),
        (FactorId::Whales, 5.0),
        (FactorId::Rsi, -9.5),
    ]);
    input.extend(background().into_iter().filter(|s| s.id != FactorId::Rsi));
    let result = engine
        .evaluate(EvaluationRequest::new("ETH", input, t0()))
        .await;

    // 10 + 8 + 4 - 3.8 + 0.39
    assert!((result.raw_score - 18.59).abs() < 1e-9, "raw {}", result.raw_score);
    assert_eq!(result.rule.as_deref(), Some("extreme_factor_override"));
    assert!(result.adjusted_score < 0.0);
    assert_eq!(result.direction, Direction::Short);
    assert!(result.conflict_note.unwrap().contains("rsi"));
}

#[tokio::test]
async fn test_scenario_c_bearish_majority_dampens_bullish_aggregate() {
    let engine = engine();
    let input = scores(&[
        (FactorId::Trend, 10.0),
        (FactorId::Momentum, 10.0),
        (FactorId::Whales, 10.0),
        (FactorId::Mfi, -1.0),
        (FactorId::Cci, -1.0),
        (FactorId::Adx, -1.0),
        (FactorId::FundingRate, -1.0),
        (FactorId::OpenInterest, -1.0),
        (FactorId::LongShortRatio, -1.0),
        (FactorId::ExchangeFlows, -1.0),
        (FactorId::OrderBook, -1.0),
    ]);
    let result = engine
        .evaluate(EvaluationRequest::new("ETH", input, t0()))
        .await;

    assert_eq!((result.bullish_count, result.bearish_count), (3, 8));
    assert!(result.raw_score > 20.0);
    assert_eq!(result.rule.as_deref(), Some("consensus_dampening"));
    assert!(result.adjusted_score.abs() < result.raw_score * 0.5);
    assert_ne!(result.direction, Direction::Long);
}

#[tokio::test]
async fn test_scenario_d_strong_leader_blocks_opposite_dependent() {
    let engine = engine();
    let leader = engine
        .evaluate(EvaluationRequest::new("BTC", strong_leader(), t0()))
        .await;
    assert!((leader.total_score - 60.0).abs() < 1e-9);
    assert_eq!(leader.direction, Direction::Long);

    let eth = engine
        .evaluate(EvaluationRequest::new("ETH", mildly_bearish(), t0() + Duration::minutes(1)))
        .await;
    assert_eq!(eth.raw_direction, Direction::Short);
    assert!(eth.total_score >= 0.0);
    assert_ne!(eth.direction, Direction::Short);
    let correlation = eth.correlation.as_ref().unwrap();
    assert!(correlation.applied());
    assert!(correlation.conflict);

    let ton = engine
        .evaluate(EvaluationRequest::new("TON", clearly_bearish(), t0() + Duration::minutes(1)))
        .await;
    let correlation = ton.correlation.as_ref().unwrap();
    assert!(correlation.clamped);
    assert_eq!(ton.total_score, 0.0);
    assert_eq!(ton.direction, Direction::Neutral);
    assert!(ton.conflict_note.unwrap().contains("Leader BTC"));
}

#[tokio::test]
async fn test_scenario_e_expired_leader_signal_is_ignored() {
    let engine = engine();
    engine
        .evaluate(EvaluationRequest::new("BTC", strong_leader(), t0()))
        .await;

    let later = t0() + Duration::minutes(11);
    assert!(engine.leader_signal(later).await.is_none());

    let eth = engine
        .evaluate(EvaluationRequest::new("ETH", mildly_bearish(), later))
        .await;
    let correlation = eth.correlation.as_ref().unwrap();
    assert_eq!(correlation.skipped, Some(CorrelationSkip::Expired));
    assert!((eth.total_score - eth.adjusted_score).abs() < 1e-9);
    assert_eq!(eth.direction, Direction::Short);
}

#[tokio::test]
async fn test_no_leader_signal_leaves_dependent_unchanged() {
    let engine = engine();
    let eth = engine
        .evaluate(EvaluationRequest::new("ETH", mildly_bearish(), t0()))
        .await;
    let correlation = eth.correlation.unwrap();
    assert_eq!(correlation.skipped, Some(CorrelationSkip::NoSignal));
    assert!(!correlation.conflict);
    assert_eq!(eth.direction, Direction::Short);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_evaluates_leader_first_and_keeps_order() {
    let engine = Arc::new(engine());
    let requests = vec![
        EvaluationRequest::new("ETH", mildly_bearish(), t0()),
        EvaluationRequest::new("TON", clearly_bearish(), t0()),
        EvaluationRequest::new("BTC", strong_leader(), t0()),
    ];
    let results: Vec<_> = engine.evaluate_batch(requests).await.into_iter().flatten().collect();
    assert_eq!(results.len(), 3);

    let instruments: Vec<&str> = results.iter().map(|r| r.instrument.as_str()).collect();
    assert_eq!(instruments, vec!["ETH", "TON", "BTC"]);
    for dependent in &results[..2] {
        let correlation = dependent.correlation.as_ref().unwrap();
        assert!(correlation.applied(), "{} was not adjusted", dependent.instrument);
    }
    assert!(results[2].correlation.is_none());
}

#[tokio::test]
async fn test_probability_stays_in_band() {
    let engine = engine();
    let inputs = [strong_leader(), mildly_bearish(), clearly_bearish(), Vec::new()];
    for (i, input) in inputs.into_iter().enumerate() {
        let result = engine
            .evaluate(EvaluationRequest::new("SOL", input, t0() + Duration::minutes(i as i64)))
            .await;
        assert!(
            (50.0..=78.0).contains(&result.probability),
            "probability {}",
            result.probability
        );
    }
}

#[tokio::test]
async fn test_result_serializes_to_json() {
    let engine = engine();
    let result = engine
        .evaluate(EvaluationRequest::new("ETH", mildly_bearish(), t0()))
        .await;
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["direction"], "short");
    assert_eq!(json["instrument"], "ETH");
    assert!(json["contributions"].as_array().unwrap().len() >= 2);
}
