// Hot config reload: a weights file that sums to 0.99 is rejected and the
// previous config stays active with a "config_rejected" audit event; the
// corrected file is accepted and applies from the next tick.

mod common;

use meridian::orchestrator::Orchestrator;

#[tokio::test]
async fn bad_weight_sum_rejected_then_corrected_file_accepted() {
    let dir = std::env::temp_dir().join(format!("meridian-reload-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("meridian.json");

    let initial = common::base_config();
    initial.save(&path).unwrap();

    let h = common::build(initial.clone());
    let (orchestrator, _controller) = Orchestrator::new(
        h.ctx.clone(),
        h.router.clone(),
        h.exec.clone(),
        Some(path.clone()),
    );

    // Sanity: the initial config is active.
    assert_eq!(h.ctx.config().scorer.entry_threshold, 40.0);

    // A broken update lands on disk: trend weight shaved, sum = 0.99.
    let mut broken = initial.clone();
    broken.scorer.weights.trend -= 0.01;
    broken.scorer.entry_threshold = 70.0;
    // Bypass the validating save: write raw JSON as an outside editor would.
    std::fs::write(&path, serde_json::to_string_pretty(&broken).unwrap()).unwrap();

    orchestrator.try_reload_config().await;

    // Rejected: the old weights and threshold still apply.
    assert_eq!(h.ctx.config().scorer.entry_threshold, 40.0);
    assert!((h.ctx.config().scorer.weights.sum() - 1.0).abs() < 1e-9);
    assert_eq!(h.store.audit_count("config_rejected"), 1);
    assert_eq!(h.store.audit_count("config_reloaded"), 0);

    // The corrected file (sum = 1.0) is accepted.
    let mut fixed = initial.clone();
    fixed.scorer.entry_threshold = 70.0;
    fixed.save(&path).unwrap();

    orchestrator.try_reload_config().await;
    assert_eq!(h.ctx.config().scorer.entry_threshold, 70.0);
    assert_eq!(h.store.audit_count("config_reloaded"), 1);

    std::fs::remove_dir_all(&dir).ok();
}
