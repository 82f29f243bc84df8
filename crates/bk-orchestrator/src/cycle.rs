//! Per-bar lifecycle driver (spec.md §4.G): sequences `bk-lifecycle`'s pure
//! per-bar steps in the fixed order the closing paragraph of §4.G names —
//! sync against broker, climax exit, breakeven & trailing, soft-stop
//! evaluation, cancel expired pendings, adopt fills, submit new signal.
//!
//! Grounded on `mqk-execution/src/engine.rs`'s single ordered pass over
//! target state per tick; the individual checks it diffs against come from
//! `bk-lifecycle` instead of a target-position table.

use bk_config::EngineConfig;
use bk_execution::{BrokerAdapter, BrokerResult, StopOrderRequest};
use bk_lifecycle::{
    evaluate_breakeven, evaluate_climax_exit, evaluate_soft_stop_on_bar_close, evaluate_structural_trailing, pending_order_expired, EntryPlan, Leg,
    LegIntent, PendingStopOrder, Position,
};
use bk_patterns::SignalKind;
use bk_schemas::Bar;

/// One user's live book for a single symbol: the open Scalp/Runner legs (if
/// any) plus any stop-order entries still working.
#[derive(Clone, Debug, Default)]
pub struct PositionGroup {
    pub scalp: Option<Position>,
    pub runner: Option<Position>,
    pub pendings: Vec<PendingStopOrder>,
}

impl PositionGroup {
    fn leg_mut(&mut self, leg: Leg) -> &mut Option<Position> {
        match leg {
            Leg::Scalp => &mut self.scalp,
            Leg::Runner => &mut self.runner,
        }
    }
}

/// Bar-level facts the driver needs, assembled by the caller from
/// `bk-marketdata`/`bk-regime`/`bk-swing` for the symbol this group belongs
/// to.
pub struct BarCycleInput<'a> {
    pub closed_bar: &'a Bar,
    pub atr: f64,
    pub in_tight_channel: bool,
    pub mean_prev5_body: f64,
    pub channel_extreme: f64,
    pub ltf_new_extreme: Option<f64>,
    pub current_price: f64,
    pub now_millis: i64,
}

/// A signal staged into an entry by the caller (`bk_risk::compute_risk_plan`
/// + `bk_orchestrator::compute_quantity` + `bk_lifecycle::stage_entry`),
/// ready to submit as the final step of this bar's cycle.
pub struct NewEntry {
    pub plan: EntryPlan,
    pub signal_kind: SignalKind,
    /// Stop-order trigger price (`bk_risk::stop_order_entry_price`).
    pub entry_price: f64,
    pub expiry: i64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BarCycleOutcome {
    pub climax_exits: u32,
    pub soft_stops: u32,
    pub trailing_updates: u32,
    pub breakevens_applied: u32,
    pub pendings_cancelled: u32,
    pub fills_adopted: u32,
    pub legs_submitted: u32,
}

/// Runs one bar's §4.G cycle for `group` against `broker`, in order. Each
/// step mutates `group`/issues broker calls before the next step runs, so a
/// leg closed by climax-exit never gets evaluated for breakeven, and a leg
/// adopted from a fill this bar is eligible for breakeven/trailing only on
/// the *next* call (matching "move the Runner's stop on the next new bar").
pub async fn run_bar_cycle<B: BrokerAdapter>(
    cfg: &EngineConfig,
    broker: &B,
    group: &mut PositionGroup,
    input: &BarCycleInput<'_>,
    new_entry: Option<NewEntry>,
) -> BrokerResult<BarCycleOutcome> {
    let mut outcome = BarCycleOutcome::default();

    // 1. Sync against broker: broker truth about what's still open/pending.
    let live_positions = broker.list_positions(None).await?;
    let live_pendings = broker.list_pending_orders(None).await?;
    for leg in [Leg::Scalp, Leg::Runner] {
        let still_open = group.leg_mut(leg).as_ref().is_some_and(|pos| live_positions.iter().any(|p| p.position_id == pos.id));
        if !still_open {
            *group.leg_mut(leg) = None;
        }
    }

    // 2. Climax exit (Runner only, spec.md §4.G).
    if let Some(pos) = group.runner.as_ref() {
        if evaluate_climax_exit(pos, input.in_tight_channel, input.closed_bar, input.mean_prev5_body, input.channel_extreme) {
            broker.close_position(&pos.id).await?;
            group.runner = None;
            outcome.climax_exits += 1;
        }
    }

    // 3. Breakeven & structural trailing.
    let scalp_closed = group.scalp.is_none();
    for leg in [Leg::Scalp, Leg::Runner] {
        if let Some(pos) = group.leg_mut(leg).as_mut() {
            if let Some((stop, hard)) = evaluate_structural_trailing(cfg, pos, input.atr, input.ltf_new_extreme) {
                pos.technical_stop = stop;
                pos.hard_stop = hard;
                broker.modify_position(&pos.id, hard, leg_tp(pos)).await?;
                outcome.trailing_updates += 1;
            }
            if let Some(stop) = evaluate_breakeven(cfg, pos, scalp_closed, pos.single_leg_fallback, input.current_price) {
                pos.technical_stop = stop;
                pos.breakeven_applied_flag = true;
                broker.modify_position(&pos.id, stop, leg_tp(pos)).await?;
                outcome.breakevens_applied += 1;
            }
        }
    }

    // 4. Soft-stop evaluation (bar close).
    for leg in [Leg::Scalp, Leg::Runner] {
        let should_close = group.leg_mut(leg).as_mut().is_some_and(|pos| evaluate_soft_stop_on_bar_close(cfg, pos, input.closed_bar));
        if should_close {
            if let Some(pos) = group.leg_mut(leg).take() {
                broker.close_position(&pos.id).await?;
                outcome.soft_stops += 1;
            }
        }
    }

    // 5. Cancel expired pendings.
    let mut i = 0;
    while i < group.pendings.len() {
        if pending_order_expired(&group.pendings[i], input.now_millis) {
            let stale = group.pendings.remove(i);
            broker.cancel_order(&stale.order_id).await?;
            outcome.pendings_cancelled += 1;
        } else {
            i += 1;
        }
    }

    // 6. Adopt fills: a pending entry order no longer on the broker's
    // working-order list, but whose magic now shows up among live
    // positions, has filled.
    let mut i = 0;
    while i < group.pendings.len() {
        let still_pending = live_pendings.iter().any(|p| p.order_id == group.pendings[i].order_id);
        if still_pending {
            i += 1;
            continue;
        }
        let filled = group.pendings.remove(i);
        if let Some(broker_pos) = live_positions.iter().find(|p| p.magic == filled.magic) {
            *group.leg_mut(filled.leg) = Some(Position {
                id: broker_pos.position_id.clone(),
                user_id: String::new(),
                side: filled.side,
                leg: filled.leg,
                magic: filled.magic,
                entry_price: broker_pos.entry_price,
                volume: broker_pos.qty,
                technical_stop: filled.technical_stop,
                hard_stop: filled.hard_stop,
                tp1: matches!(filled.leg, Leg::Scalp).then_some(filled.tp.unwrap_or(broker_pos.tp)),
                tp2: matches!(filled.leg, Leg::Runner).then_some(filled.tp.unwrap_or(broker_pos.tp)),
                open_time: input.closed_bar.open_time,
                scalp_closed_flag: false,
                breakeven_applied_flag: false,
                consecutive_beyond_stop: 0,
                single_leg_fallback: filled.single_leg_fallback,
            });
            outcome.fills_adopted += 1;
        }
    }

    // 7. Submit new signal, staged by the caller.
    if let Some(entry) = new_entry {
        outcome.legs_submitted += submit_entry_plan(broker, &mut group.pendings, entry).await?;
    }

    Ok(outcome)
}

fn leg_tp(pos: &Position) -> f64 {
    pos.tp1.or(pos.tp2).unwrap_or(pos.technical_stop)
}

async fn submit_entry_plan<B: BrokerAdapter>(broker: &B, pendings: &mut Vec<PendingStopOrder>, entry: NewEntry) -> BrokerResult<u32> {
    match entry.plan {
        EntryPlan::Twin(scalp, runner) => {
            submit_leg(broker, pendings, scalp, entry.signal_kind, entry.entry_price, entry.expiry, false).await?;
            submit_leg(broker, pendings, runner, entry.signal_kind, entry.entry_price, entry.expiry, false).await?;
            Ok(2)
        }
        EntryPlan::SingleLegFallback(leg) => {
            submit_leg(broker, pendings, leg, entry.signal_kind, entry.entry_price, entry.expiry, true).await?;
            Ok(1)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn submit_leg<B: BrokerAdapter>(
    broker: &B,
    pendings: &mut Vec<PendingStopOrder>,
    leg: LegIntent,
    signal_kind: SignalKind,
    entry_price: f64,
    expiry: i64,
    single_leg_fallback: bool,
) -> BrokerResult<()> {
    let tp = leg.tp.unwrap_or(leg.technical_stop);
    let order_id = broker
        .place_stop(StopOrderRequest {
            side: leg.side,
            stop_price: entry_price,
            qty: leg.qty,
            expiry,
            sl: leg.hard_stop,
            tp,
            magic: leg.magic,
        })
        .await?;
    pendings.push(PendingStopOrder {
        order_id,
        leg: leg.leg,
        side: leg.side,
        stop_price: entry_price,
        technical_stop: leg.technical_stop,
        hard_stop: leg.hard_stop,
        tp: leg.tp,
        signal_kind,
        magic: leg.magic,
        single_leg_fallback,
        expiry,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bk_broker_paper::PaperBroker;
    use bk_schemas::Side;

    fn bar(o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            open_time: 0,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1.0,
        }
    }

    fn base_input(closed_bar: &Bar) -> BarCycleInput<'_> {
        BarCycleInput {
            closed_bar,
            atr: 1.0,
            in_tight_channel: false,
            mean_prev5_body: 1.0,
            channel_extreme: 0.0,
            ltf_new_extreme: None,
            current_price: closed_bar.close,
            now_millis: 0,
        }
    }

    fn position(leg: Leg, id: &str, magic: u32) -> Position {
        Position {
            id: id.into(),
            user_id: "u1".into(),
            side: Side::Buy,
            leg,
            magic,
            entry_price: 100.0,
            volume: 1.0,
            technical_stop: 99.0,
            hard_stop: 98.0,
            tp1: None,
            tp2: Some(103.0),
            open_time: 0,
            scalp_closed_flag: false,
            breakeven_applied_flag: false,
            consecutive_beyond_stop: 0,
            single_leg_fallback: false,
        }
    }

    #[tokio::test]
    async fn climax_exit_closes_the_runner_leg() {
        let cfg = EngineConfig::default();
        let broker = PaperBroker::new();
        broker.set_mark_price(100.0);
        broker.place_market(Side::Buy, 1.0, 9).await.unwrap();
        let position_id = broker.list_positions(Some(9)).await.unwrap()[0].position_id.clone();

        let mut group = PositionGroup {
            runner: Some(position(Leg::Runner, &position_id, 9)),
            ..Default::default()
        };

        let closed_bar = bar(100.0, 110.0, 99.0, 109.0);
        let mut input = base_input(&closed_bar);
        input.in_tight_channel = true;
        input.channel_extreme = 105.0;

        let outcome = run_bar_cycle(&cfg, &broker, &mut group, &input, None).await.unwrap();
        assert_eq!(outcome.climax_exits, 1);
        assert!(group.runner.is_none());
        assert!(broker.position(&position_id).is_none());
    }

    #[tokio::test]
    async fn new_signal_is_submitted_as_a_pending_stop_order() {
        let cfg = EngineConfig::default();
        let broker = PaperBroker::new();
        let mut group = PositionGroup::default();
        let closed_bar = bar(100.0, 101.0, 99.0, 100.5);
        let input = base_input(&closed_bar);

        let leg = LegIntent {
            leg: Leg::Runner,
            side: Side::Buy,
            qty: 1.0,
            technical_stop: 98.0,
            hard_stop: 97.0,
            tp: Some(103.0),
            magic: 11,
        };
        let entry = NewEntry {
            plan: EntryPlan::SingleLegFallback(leg),
            signal_kind: SignalKind::Spike,
            entry_price: 101.5,
            expiry: 1_000_000,
        };

        let outcome = run_bar_cycle(&cfg, &broker, &mut group, &input, Some(entry)).await.unwrap();
        assert_eq!(outcome.legs_submitted, 1);
        assert_eq!(group.pendings.len(), 1);
        assert!(group.pendings[0].single_leg_fallback);
        assert_eq!(broker.list_pending_orders(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn a_filled_pending_is_adopted_into_the_matching_leg() {
        let cfg = EngineConfig::default();
        let broker = PaperBroker::new();
        let order_id = broker
            .place_stop(StopOrderRequest {
                side: Side::Buy,
                stop_price: 101.0,
                qty: 1.0,
                expiry: 1_000_000,
                sl: 98.0,
                tp: 103.0,
                magic: 12,
            })
            .await
            .unwrap();

        let mut group = PositionGroup {
            pendings: vec![PendingStopOrder {
                order_id: order_id.clone(),
                leg: Leg::Scalp,
                side: Side::Buy,
                stop_price: 101.0,
                technical_stop: 98.0,
                hard_stop: 97.0,
                tp: Some(103.0),
                signal_kind: SignalKind::Spike,
                magic: 12,
                single_leg_fallback: false,
                expiry: 1_000_000,
            }],
            ..Default::default()
        };

        broker.fill_pending(&order_id, 101.0).unwrap();

        let closed_bar = bar(101.0, 101.5, 100.5, 101.2);
        let input = base_input(&closed_bar);
        let outcome = run_bar_cycle(&cfg, &broker, &mut group, &input, None).await.unwrap();

        assert_eq!(outcome.fills_adopted, 1);
        assert!(group.pendings.is_empty());
        assert!(group.scalp.is_some());
        assert_eq!(group.scalp.unwrap().entry_price, 101.0);
    }

    #[tokio::test]
    async fn an_expired_pending_is_cancelled() {
        let cfg = EngineConfig::default();
        let broker = PaperBroker::new();
        let order_id = broker
            .place_stop(StopOrderRequest {
                side: Side::Sell,
                stop_price: 99.0,
                qty: 1.0,
                expiry: 500,
                sl: 101.0,
                tp: 96.0,
                magic: 13,
            })
            .await
            .unwrap();

        let mut group = PositionGroup {
            pendings: vec![PendingStopOrder {
                order_id: order_id.clone(),
                leg: Leg::Runner,
                side: Side::Sell,
                stop_price: 99.0,
                technical_stop: 101.0,
                hard_stop: 102.0,
                tp: Some(96.0),
                signal_kind: SignalKind::Spike,
                magic: 13,
                single_leg_fallback: false,
                expiry: 500,
            }],
            ..Default::default()
        };

        let closed_bar = bar(99.0, 99.5, 98.5, 99.2);
        let mut input = base_input(&closed_bar);
        input.now_millis = 1_000;

        let outcome = run_bar_cycle(&cfg, &broker, &mut group, &input, None).await.unwrap();
        assert_eq!(outcome.pendings_cancelled, 1);
        assert!(group.pendings.is_empty());
        assert!(broker.list_pending_orders(None).await.unwrap().is_empty());
    }
}
