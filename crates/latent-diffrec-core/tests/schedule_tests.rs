//! Properties shared by every schedule family.

use latent_diffrec_core::{NoiseBounds, NoiseSchedule, ScheduleKind};

const KINDS: [ScheduleKind; 4] = [
    ScheduleKind::Linear,
    ScheduleKind::LinearVar,
    ScheduleKind::Cosine,
    ScheduleKind::Binomial,
];

fn build(kind: ScheduleKind, steps: usize, beta_fixed: bool) -> NoiseSchedule {
    NoiseSchedule::new(kind, steps, NoiseBounds::new(0.1, 0.0001, 0.02), beta_fixed).unwrap()
}

#[test]
fn test_tables_are_consistent_for_all_families() {
    for kind in KINDS {
        for beta_fixed in [false, true] {
            let s = build(kind, 40, beta_fixed);
            assert_eq!(s.betas().len(), 40);
            assert!(s.betas().iter().all(|b| *b > 0.0 && *b < 1.0), "{} betas", kind);
            assert!(
                s.alphas_cumprod().windows(2).all(|w| w[1] <= w[0]),
                "{} alpha bar must not increase",
                kind
            );
            assert!((s.alphas_cumprod()[0] - (1.0 - s.betas()[0])).abs() < 1e-12);
            assert_eq!(s.alphas_cumprod_prev()[0], 1.0);
            assert_eq!(s.alphas_cumprod_next()[39], 0.0);
            assert!(s.posterior_variance().iter().all(|v| *v >= 0.0));
            for t in 1..40 {
                assert!(s.posterior_log_variance_clipped()[t].is_finite());
            }
        }
    }
}

#[test]
fn test_snr_decreases() {
    let s = build(ScheduleKind::LinearVar, 20, true);
    for t in 1..20 {
        assert!(s.snr(t) < s.snr(t - 1));
    }
}

#[test]
fn test_names_round_trip_through_parse() {
    for kind in KINDS {
        let parsed: ScheduleKind = kind.as_str().parse().unwrap();
        assert_eq!(parsed, kind);
    }
}
