// Venue partial-fill / cancel race: the cancel sweep keeps the confirmed
// fill, the record shows cancelled with the correct remainder, the position
// covers only the filled quantity, and the risk ledger holds only the filled
// share of the reservation.

mod common;

use meridian::execution::OrderStatus;
use meridian::orchestrator::{run_symbol_tick, Orchestrator};
use meridian::store::StateStore;
use meridian::types::SafeModeReason;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[tokio::test]
async fn cancel_after_partial_fill_keeps_fill_and_halves_exposure() {
    let h = common::build(common::base_config());
    common::seed_trending_book(&h, "BTCUSD", 260, 50_000.0);

    // The venue only fills half of any order.
    h.venue.set_fill_fraction(dec!(0.5));

    let report = run_symbol_tick(&h.ctx, &h.router, &h.exec, "BTCUSD", false).await;
    assert!(report.admitted, "setup entry expected: {report:?}");

    let open = h.ctx.positions.open_positions();
    assert_eq!(open.len(), 1);
    let position = open[0].clone();

    let record = h
        .store
        .load_execution(position.entry_client_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, OrderStatus::PartiallyFilled);
    let full_risk = h.ctx.risk_gate.total_open_risk();
    assert!(full_risk > Decimal::ZERO);

    // The SAFE_MODE sweep cancels the resting remainder. The venue acks the
    // cancel; the fill that already happened is server-of-truth and stays.
    let (orchestrator, _controller) =
        Orchestrator::new(h.ctx.clone(), h.router.clone(), h.exec.clone(), None);
    orchestrator
        .enter_safe_mode(SafeModeReason::Operator("race-test".into()))
        .await;

    let cancelled = h
        .store
        .load_execution(position.entry_client_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.filled_qty, record.filled_qty);
    assert_eq!(
        cancelled.remaining_qty,
        cancelled.quantity - cancelled.filled_qty
    );
    assert!(cancelled.filled_qty < cancelled.quantity);

    // Position still covers only the filled half.
    assert_eq!(h.ctx.positions.open_count(), 1);
    assert_eq!(
        h.ctx.positions.open_positions()[0].quantity,
        cancelled.filled_qty
    );

    // The ledger shrank to the filled share of the reservation.
    let reduced_risk = h.ctx.risk_gate.total_open_risk();
    assert_eq!(reduced_risk, full_risk * dec!(0.5));
}
