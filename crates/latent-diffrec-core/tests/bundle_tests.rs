//! Model bundles survive a save/load cycle.

mod common;

use common::*;
use latent_diffrec_core::category::CategoryMap;
use latent_diffrec_core::{ArtifactName, AutoEncoder, ModelBundle};

#[test]
fn test_bundle_round_trip_ranks_identically() {
    let bundle = toy_bundle(toy_config());
    let dir = tempfile::tempdir().unwrap();
    let paths = bundle.save(dir.path()).unwrap();
    assert!(paths.denoiser.ends_with("toy.safetensors"));
    assert!(paths.autoencoder.ends_with("toy_AE.safetensors"));
    assert!(paths.config.ends_with("toy.toml"));

    let loaded = ModelBundle::load(dir.path(), &ArtifactName::new("toy")).unwrap();
    assert_eq!(loaded.config, bundle.config);
    assert_eq!(loaded.n_items().unwrap(), N_ITEMS);

    let train = toy_train();
    let before = bundle
        .build_pipeline()
        .unwrap()
        .rank_users(&train, &train, &toy_labels())
        .unwrap();
    let after = loaded
        .build_pipeline()
        .unwrap()
        .rank_users(&train, &train, &toy_labels())
        .unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_stored_category_map_survives() {
    let bundle = toy_bundle(toy_config());
    let dir = tempfile::tempdir().unwrap();
    bundle.save(dir.path()).unwrap();
    let loaded = ModelBundle::load(dir.path(), &bundle.name()).unwrap();

    let ae = AutoEncoder::from_parameters(
        loaded.config.autoencoder_spec(N_ITEMS),
        &loaded.autoencoder,
    )
    .unwrap();
    let expected = CategoryMap::from_assignments(&ASSIGNMENTS, 3).unwrap();
    assert_eq!(ae.category_map(), &expected);
    assert_eq!(ae.category_map().local_to_original(), &[1, 3, 2, 5, 0, 4]);
    assert_eq!(ae.category_map().category_lens(), &[2, 2, 2]);
}

#[test]
fn test_derived_name_used_without_explicit_stem() {
    let mut config = toy_config();
    config.checkpoint.stem = None;
    let bundle = toy_bundle(config);
    let dir = tempfile::tempdir().unwrap();
    let paths = bundle.save(dir.path()).unwrap();
    let file = paths.denoiser.file_name().unwrap().to_string_lossy().into_owned();
    assert!(file.starts_with("toy_0.0001lr1_0.0001lr2_0.0wd1_0.0wd2_bs400_cate3_in[6]_out[]"));
    assert!(file.ends_with("_steps10_scale0.1_min0.0001_max0.02_sample5_reweightTrue_log.safetensors"));
}
