mod common;

use std::{sync::atomic::AtomicBool, thread, time::Duration};

use serde_json::json;
use tempfile::tempdir;
use training::{
    checkpoint::CheckpointManager,
    distributed::{LocalGroup, SingleProcess},
    launch,
    logging::MetricLog,
    DistributedContext, ErrorKind, Phase, Trainer,
};

use common::{config, config_with_corpus, flatten};

#[test]
fn two_rank_run_checkpoints_at_interval_and_end() {
    let tmp = tempdir().unwrap();
    let mut cfg = config(
        tmp.path(),
        json!({
            "distributed": { "strategy": "local", "world_size": 2, "timeout_secs": 30 },
            "evaluation": { "every_n_steps": 10, "max_batches": 2 },
            "learning_dynamics": {
                "enabled": true,
                "modules": ["attention.v_proj"],
                "every_n_steps": 5
            }
        }),
    );
    cfg.data.eval_path = Some(cfg.data.train_path.clone());
    let checkpoint_dir = cfg.checkpoint_dir();
    let dynamics_dir = cfg.learning_dynamics_dir();

    let stop = AtomicBool::new(false);
    let outcomes = launch::run_local(cfg, &stop, Trainer::new).unwrap();
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert_eq!(outcome.final_step, 20);
        assert_eq!(outcome.last_manifest.as_ref().unwrap().step, 20);
        assert_eq!(outcome.state.world_size, 2);
        assert_eq!(outcome.evaluation.as_ref().unwrap().step, 20);
    }
    assert_eq!(outcomes[0].metrics, outcomes[1].metrics);
    assert_eq!(outcomes[0].state.tokens_seen, 20 * 4 * 7);

    let manager = CheckpointManager::new(&checkpoint_dir, "", None, None, candle_core::Device::Cpu);
    assert_eq!(manager.available_steps().unwrap(), vec![0, 10, 20]);
    assert_eq!(manager.latest().unwrap(), Some(20));
    let manifests = manager.manifests().unwrap();
    assert!(manifests[0].metrics.train.is_none());
    let manifest = manifests.last().unwrap();
    assert_eq!(manifest.world_size, 2);
    assert!(manifest.file("learning_dynamics.safetensors").is_some());
    assert_eq!(manifest.metrics.train.as_ref().unwrap().step, 20);

    assert!(dynamics_dir.join("step_00000005.safetensors").is_file());
    assert!(dynamics_dir.join("step_00000015.safetensors").is_file());
    assert!(!dynamics_dir.join("step_00000010.safetensors").exists());
}

#[test]
fn resumed_run_reproduces_the_metric_log() {
    let full = tempdir().unwrap();
    let cfg = config(full.path(), json!({}));
    let full_log = cfg.logs_dir().join("metrics.jsonl");
    Trainer::new(cfg, Box::new(SingleProcess))
        .unwrap()
        .run(|| false)
        .unwrap();

    let split = tempdir().unwrap();
    let cfg = config(split.path(), json!({}));
    let split_log = cfg.logs_dir().join("metrics.jsonl");
    let mut polls = 0;
    let first = Trainer::new(cfg.clone(), Box::new(SingleProcess))
        .unwrap()
        .run(|| {
            polls += 1;
            polls == 10
        })
        .unwrap();
    assert_eq!(first.final_step, 10);
    assert_eq!(first.last_manifest.unwrap().step, 10);

    let second = Trainer::new(cfg, Box::new(SingleProcess))
        .unwrap()
        .run(|| false)
        .unwrap();
    assert_eq!(second.final_step, 20);

    let expected = MetricLog::read(&full_log).unwrap();
    let resumed = MetricLog::read(&split_log).unwrap();
    assert_eq!(expected.len(), 20);
    assert_eq!(resumed.len(), 20);
    for (a, b) in expected.iter().zip(&resumed) {
        assert_eq!(a.step, b.step);
        assert_eq!(a.tokens, b.tokens);
        assert!((a.loss - b.loss).abs() <= 1e-5 * a.loss.abs().max(1.0), "step {}", a.step);
        assert!((a.learning_rate - b.learning_rate).abs() < 1e-12);
    }
}

#[test]
fn missing_watched_module_fails_during_init() {
    let tmp = tempdir().unwrap();
    let cfg = config(
        tmp.path(),
        json!({ "learning_dynamics": { "enabled": true, "modules": ["attention.q_norm"] } }),
    );
    let checkpoint_dir = cfg.checkpoint_dir();
    let err = Trainer::new(cfg, Box::new(SingleProcess)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.context(), Some((0, 0)));
    assert!(!checkpoint_dir.exists());
}

#[test]
fn stop_request_completes_the_current_step() {
    let tmp = tempdir().unwrap();
    let cfg = config(tmp.path(), json!({}));
    let checkpoint_dir = cfg.checkpoint_dir();
    let mut trainer = Trainer::new(cfg, Box::new(SingleProcess)).unwrap();
    let outcome = trainer.run(|| true).unwrap();
    assert_eq!(outcome.final_step, 1);
    assert_eq!(outcome.last_manifest.unwrap().step, 1);
    assert_eq!(trainer.phase(), Phase::Terminated);

    let manager = CheckpointManager::new(&checkpoint_dir, "", None, None, candle_core::Device::Cpu);
    assert_eq!(manager.available_steps().unwrap(), vec![0, 1]);
    assert_eq!(manager.load(0).unwrap().state.global_step, 0);
}

#[test]
fn capture_does_not_perturb_training() {
    let plain = tempdir().unwrap();
    let mut trainer = Trainer::new(
        config(plain.path(), json!({ "training": { "max_steps": 4 } })),
        Box::new(SingleProcess),
    )
    .unwrap();
    let baseline = trainer.run(|| false).unwrap();
    let baseline_params = flatten(&trainer.adapter().export_state().unwrap().0.parameters);

    let captured = tempdir().unwrap();
    let mut trainer = Trainer::new(
        config(
            captured.path(),
            json!({
                "training": { "max_steps": 4 },
                "learning_dynamics": {
                    "enabled": true,
                    "modules": ["embedding", "swiglu.w_2"],
                    "every_n_steps": 2
                }
            }),
        ),
        Box::new(SingleProcess),
    )
    .unwrap();
    let observed = trainer.run(|| false).unwrap();
    let observed_params = flatten(&trainer.adapter().export_state().unwrap().0.parameters);

    assert_eq!(baseline.metrics.unwrap().loss, observed.metrics.unwrap().loss);
    assert_eq!(baseline_params, observed_params);
}

#[test]
fn weightless_watched_module_fails_during_init() {
    let tmp = tempdir().unwrap();
    let cfg = config(
        tmp.path(),
        json!({ "learning_dynamics": { "enabled": true, "modules": ["attention"] } }),
    );
    let err = Trainer::new(cfg, Box::new(SingleProcess)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.context(), Some((0, 0)));
    assert!(err.to_string().contains("layers.0.attention"));
}

#[test]
fn evaluation_batch_capture_leaves_training_unchanged() {
    let plain = tempdir().unwrap();
    let mut trainer = Trainer::new(
        config(plain.path(), json!({ "training": { "max_steps": 4 } })),
        Box::new(SingleProcess),
    )
    .unwrap();
    let baseline = trainer.run(|| false).unwrap();
    let baseline_params = flatten(&trainer.adapter().export_state().unwrap().0.parameters);

    let captured = tempdir().unwrap();
    let cfg = config(
        captured.path(),
        json!({
            "training": { "max_steps": 4 },
            "learning_dynamics": {
                "enabled": true,
                "modules": ["attention.v_proj"],
                "every_n_steps": 2,
                "eval_data": captured.path().join("corpus"),
                "batch_size": 3
            }
        }),
    );
    let dynamics_dir = cfg.learning_dynamics_dir();
    let mut trainer = Trainer::new(cfg, Box::new(SingleProcess)).unwrap();
    let observed = trainer.run(|| false).unwrap();
    let observed_params = flatten(&trainer.adapter().export_state().unwrap().0.parameters);

    assert_eq!(baseline.metrics.unwrap().loss, observed.metrics.unwrap().loss);
    assert_eq!(baseline_params, observed_params);

    let tensors = candle_core::safetensors::load(
        dynamics_dir.join("step_00000002.safetensors"),
        &candle_core::Device::Cpu,
    )
    .unwrap();
    let activation = &tensors["eval/layers.0.attention.v_proj.activation"];
    assert_eq!(activation.dims(), &[3, 16]);
    assert!(tensors.contains_key("eval/layers.0.attention.v_proj.gradient"));
    assert!(tensors.contains_key("layers.0.attention.v_proj.gradient"));
}

#[test]
fn failure_is_annotated_and_the_last_step_is_saved() {
    let tmp = tempdir().unwrap();
    // 64 sequences cover 16 steps of batch 4.
    let cfg = config_with_corpus(tmp.path(), 64, json!({}));
    let checkpoint_dir = cfg.checkpoint_dir();
    let mut trainer = Trainer::new(cfg, Box::new(SingleProcess)).unwrap();

    let err = trainer.run(|| false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataExhausted);
    assert_eq!(err.context(), Some((17, 0)));
    assert_eq!(trainer.phase(), Phase::Failed);
    assert_eq!(trainer.state().global_step, 16);

    let manager = CheckpointManager::new(&checkpoint_dir, "", None, None, candle_core::Device::Cpu);
    assert_eq!(manager.available_steps().unwrap(), vec![0, 10, 16]);
    assert_eq!(manager.latest().unwrap(), Some(16));
    let saved = manager.load(16).unwrap();
    assert_eq!(saved.state.global_step, 16);
    assert_eq!(saved.manifest.metrics.train.unwrap().step, 16);
}

#[test]
fn one_rank_stop_request_stops_every_rank() {
    let tmp = tempdir().unwrap();
    let cfg = config(
        tmp.path(),
        json!({ "distributed": { "strategy": "local", "world_size": 2, "timeout_secs": 30 } }),
    );
    let checkpoint_dir = cfg.checkpoint_dir();
    let contexts = LocalGroup::create(2, Duration::from_secs(30)).unwrap();

    let outcomes: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = contexts
            .into_iter()
            .map(|ctx| {
                let cfg = cfg.clone();
                scope.spawn(move || {
                    let rank = ctx.rank();
                    let mut polls = 0;
                    Trainer::new(cfg, Box::new(ctx))
                        .unwrap()
                        .run(|| {
                            polls += 1;
                            rank == 1 && polls == 3
                        })
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for outcome in &outcomes {
        assert_eq!(outcome.final_step, 3);
        assert_eq!(outcome.last_manifest.as_ref().unwrap().step, 3);
    }
    let manager = CheckpointManager::new(&checkpoint_dir, "", None, None, candle_core::Device::Cpu);
    assert_eq!(manager.latest().unwrap(), Some(3));
}
