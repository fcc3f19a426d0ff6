//! End-to-end training loops: a least-squares model whose backward pass
//! produces FP16 gradients, driven through the loss scaler.

use ampscale::checkpoint::{ScalerCheckpoint, load_checkpoint, save_checkpoint};
use ampscale::{GradScaler, Gradients, GroupId, ScalerConfig, StepOutcome, clip_grad_norm};
use half::f16;
use tempfile::TempDir;

const XS: [[f32; 2]; 4] = [[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.5, -0.5]];
const YS: [f32; 4] = [2.0, -1.0, 1.0, 1.5];

fn loss(w: &[f32]) -> f64 {
    XS.iter()
        .zip(YS)
        .map(|(x, y)| {
            let err = (w[0] * x[0] + w[1] * x[1] - y) as f64;
            err * err
        })
        .sum::<f64>()
        / XS.len() as f64
}

/// Backward of `scale * loss(w)`, stored in FP16 like a half-precision
/// activation/gradient pipeline would.
fn backward_f16(w: &[f32], scale: f64) -> Vec<f16> {
    let mut grad = [0.0f64; 2];
    for (x, y) in XS.iter().zip(YS) {
        let err = (w[0] * x[0] + w[1] * x[1] - y) as f64;
        grad[0] += 2.0 * err * x[0] as f64;
        grad[1] += 2.0 * err * x[1] as f64;
    }
    grad.iter()
        .map(|g| f16::from_f64(scale * g / XS.len() as f64))
        .collect()
}

/// FP32 master copy of FP16 gradients.
fn to_master(grads: &[f16]) -> Vec<f32> {
    grads.iter().map(|g| g.to_f32()).collect()
}

fn sgd(params: &mut [f32], grads: &[f32], lr: f32) {
    for (p, g) in params.iter_mut().zip(grads) {
        *p -= lr * g;
    }
}

#[test]
fn test_scaling_prevents_fp16_underflow() {
    let tiny = 1e-8f64;
    assert_eq!(f16::from_f64(tiny).to_f64(), 0.0);

    let scaler = GradScaler::default_fp16();
    let scaled = f16::from_f64(scaler.scale_loss(tiny));
    assert!(scaled.to_f64() > 0.0);

    let mut scaler = scaler;
    let mut master = vec![scaled.to_f32()];
    assert!(!scaler.unscale(GroupId(0), &mut master).expect("unscale"));
    assert!((master[0] as f64 - tiny).abs() / tiny < 1e-3);
}

#[test]
fn test_fp16_training_converges() {
    let mut scaler = GradScaler::new(ScalerConfig::default().with_growth_interval(10))
        .expect("valid config");
    let mut w = vec![0.0f32, 0.0];
    let first_loss = loss(&w);

    for _ in 0..100 {
        let mut grads = to_master(&backward_f16(&w, scaler.scale()));
        scaler
            .step(GroupId(0), &mut grads, |g| sgd(&mut w, g, 0.1))
            .expect("step");
        scaler.update();
    }

    let last_loss = loss(&w);
    assert!(
        last_loss < first_loss * 0.01,
        "loss should decrease: first={first_loss} last={last_loss}"
    );

    // 65536 overflows FP16 on the first step, so the scaler had to back off
    let stats = scaler.stats();
    assert!(stats.backoff_events >= 1);
    assert!(stats.skipped_steps >= 1);
    assert!(stats.growth_events >= 1);
    assert_eq!(stats.steps, 100);
}

#[test]
fn test_first_step_overflow_leaves_params_untouched() {
    let mut scaler = GradScaler::default_fp16();
    let mut w = vec![0.0f32, 0.0];

    let raw = backward_f16(&w, scaler.scale());
    assert!(raw.iter().any(|g| g.is_infinite()));

    let mut grads = to_master(&raw);
    let outcome = scaler
        .step(GroupId(0), &mut grads, |g| sgd(&mut w, g, 0.1))
        .expect("step");
    scaler.update();

    assert_eq!(outcome, StepOutcome::Skipped);
    assert_eq!(w, vec![0.0, 0.0]);
    assert_eq!(scaler.scale(), 32768.0);
}

#[test]
fn test_two_optimizers_share_overflow() {
    let mut scaler = GradScaler::new(ScalerConfig::default().with_init_scale(4.0))
        .expect("valid config");
    let mut params_a = vec![1.0f32, 1.0];
    let mut params_b = vec![1.0f32, 1.0];
    let mut grads_a = vec![f32::NAN, 4.0];
    let mut grads_b = vec![4.0f32, 8.0];

    scaler.unscale(GroupId(0), &mut grads_a).expect("unscale a");
    scaler.unscale(GroupId(1), &mut grads_b).expect("unscale b");

    // Step order does not matter once every group is unscaled
    let b = scaler
        .step(GroupId(1), &mut grads_b, |g| sgd(&mut params_b, g, 1.0))
        .expect("step b");
    let a = scaler
        .step(GroupId(0), &mut grads_a, |g| sgd(&mut params_a, g, 1.0))
        .expect("step a");
    scaler.update();

    assert!(a.is_skipped());
    assert!(b.is_skipped());
    assert_eq!(params_a, vec![1.0, 1.0]);
    assert_eq!(params_b, vec![1.0, 1.0]);
    assert_eq!(scaler.scale(), 2.0);

    // Next step is clean for both
    let mut grads_a = vec![2.0f32, 2.0];
    let mut grads_b = vec![2.0f32, 0.0];
    scaler.unscale(GroupId(0), &mut grads_a).expect("unscale a");
    scaler.unscale(GroupId(1), &mut grads_b).expect("unscale b");
    scaler
        .step(GroupId(0), &mut grads_a, |g| sgd(&mut params_a, g, 1.0))
        .expect("step a");
    scaler
        .step(GroupId(1), &mut grads_b, |g| sgd(&mut params_b, g, 1.0))
        .expect("step b");
    scaler.update();

    assert_eq!(params_a, vec![0.0, 0.0]);
    assert_eq!(params_b, vec![0.0, 1.0]);
}

#[test]
fn test_two_optimizers_step_without_unscale() {
    let mut scaler = GradScaler::new(ScalerConfig::default().with_init_scale(4.0))
        .expect("valid config");
    let mut params_a = vec![1.0f32, 1.0];
    let mut params_b = vec![1.0f32, 1.0];
    let mut grads_a = vec![f32::NAN, 4.0];
    let mut grads_b = vec![4.0f32, 8.0];

    // A unscales inside its own step and raises the flag B then sees
    let a = scaler
        .step(GroupId(0), &mut grads_a, |g| sgd(&mut params_a, g, 1.0))
        .expect("step a");
    assert!(scaler.found_inf());
    let b = scaler
        .step(GroupId(1), &mut grads_b, |g| sgd(&mut params_b, g, 1.0))
        .expect("step b");
    scaler.update();

    assert!(a.is_skipped());
    assert!(b.is_skipped());
    assert_eq!(grads_b, vec![1.0, 2.0]);
    assert_eq!(params_a, vec![1.0, 1.0]);
    assert_eq!(params_b, vec![1.0, 1.0]);
    assert_eq!(scaler.scale(), 2.0);
    assert_eq!(scaler.stats().skipped_steps, 1);
}

#[test]
fn test_clip_after_unscale() {
    let mut scaler = GradScaler::new(ScalerConfig::default().with_init_scale(1024.0))
        .expect("valid config");
    let mut w = vec![0.0f32, 0.0];

    let norm = scaler
        .run_step(|step| {
            // Unscaled gradient [3, 4] has norm 5
            let mut grads = vec![3.0f32 * 1024.0, 4.0 * 1024.0];
            step.unscale(GroupId(0), &mut grads)?;
            let norm = clip_grad_norm(&mut grads, 1.0)?;
            step.step(GroupId(0), &mut grads, |g| sgd(&mut w, g, 1.0))?;
            Ok::<_, ampscale::Error>(norm)
        })
        .expect("run_step");

    assert!((norm - 5.0).abs() < 1e-4);
    assert!((w[0] + 0.6).abs() < 1e-4);
    assert!((w[1] + 0.8).abs() < 1e-4);
}

#[test]
fn test_gradient_penalty() {
    let mut scaler = GradScaler::new(ScalerConfig::default().with_init_scale(256.0))
        .expect("valid config");
    let w = vec![0.5f32, -0.5];

    // Gradients of the scaled loss taken by hand, not through an optimizer
    let mut penalty_grads = to_master(&backward_f16(&w, scaler.scale()));
    penalty_grads.mul_scalar_inplace(scaler.inv_scale());
    let penalty = penalty_grads.sum_of_squares();

    let expected = to_master(&backward_f16(&w, 1.0)).sum_of_squares();
    assert!((penalty - expected).abs() / expected < 1e-2);

    // The penalised loss goes through the regular scaled path
    let total = loss(&w) + penalty;
    assert_eq!(scaler.scale_loss(total), total * 256.0);
    scaler.update();
}

#[test]
fn test_disabled_scaler_same_loop() {
    let mut scaler = GradScaler::new(ScalerConfig::disabled()).expect("valid config");
    let mut w = vec![0.0f32, 0.0];

    for _ in 0..50 {
        let mut grads = to_master(&backward_f16(&w, scaler.scale()));
        let outcome = scaler
            .step(GroupId(0), &mut grads, |g| sgd(&mut w, g, 0.1))
            .expect("step");
        assert!(!outcome.is_skipped());
        scaler.update();
    }

    assert!(loss(&w) < 0.1);
    assert_eq!(scaler.scale(), 1.0);
}

/// Overflow pattern replayed identically before and after a checkpoint.
fn drive(scaler: &mut GradScaler, overflow: bool) {
    let mut grads = if overflow {
        vec![f32::INFINITY, 1.0]
    } else {
        vec![1.0f32, 1.0]
    };
    scaler.step(GroupId(0), &mut grads, |_| ()).expect("step");
    scaler.update();
}

#[test]
fn test_resume_reproduces_scale_trajectory() {
    let config = ScalerConfig::default()
        .with_init_scale(1024.0)
        .with_growth_interval(3);
    let pattern = [
        false, false, true, false, false, false, false, true, false, false, false, false, false,
    ];
    let (before, after) = pattern.split_at(5);

    let mut original = GradScaler::new(config).expect("valid config");
    for &overflow in before {
        drive(&mut original, overflow);
    }

    let dir = TempDir::new().expect("tempdir");
    let checkpoint = ScalerCheckpoint::new(before.len() as u64, original.state());
    save_checkpoint(dir.path(), &checkpoint).expect("save");

    let loaded = load_checkpoint(dir.path()).expect("load");
    let mut resumed = GradScaler::resume(config, loaded.scaler.as_ref()).expect("resume");
    assert_eq!(resumed.growth_tracker(), original.growth_tracker());

    for &overflow in after {
        drive(&mut original, overflow);
        drive(&mut resumed, overflow);
        assert_eq!(original.scale().to_bits(), resumed.scale().to_bits());
        assert_eq!(original.growth_tracker(), resumed.growth_tracker());
    }
}

#[test]
fn test_resume_run_without_scaling() {
    let dir = TempDir::new().expect("tempdir");
    let disabled = GradScaler::disabled();
    save_checkpoint(dir.path(), &ScalerCheckpoint::new(7, disabled.state())).expect("save");

    let loaded = load_checkpoint(dir.path()).expect("load");
    assert!(loaded.scaler.is_none());

    let scaler = GradScaler::resume(ScalerConfig::fp16(), loaded.scaler.as_ref()).expect("resume");
    assert_eq!(scaler.scale(), 65536.0);
    assert_eq!(scaler.growth_tracker(), 0);
}

#[test]
fn test_resume_rejects_corrupt_state() {
    let dir = TempDir::new().expect("tempdir");
    let json = r#"{"step": 3, "scaler": {"scale": 0.0, "growth_factor": 2.0, "backoff_factor": 0.5, "growth_interval": 10, "growth_tracker": 0}}"#;
    std::fs::write(dir.path().join("scaler_state.json"), json).expect("write");

    let loaded = load_checkpoint(dir.path()).expect("load");
    let err = GradScaler::resume(ScalerConfig::fp16(), loaded.scaler.as_ref()).unwrap_err();
    assert!(matches!(err, ampscale::Error::InvalidState { .. }));
}
