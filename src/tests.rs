use crate::distance::array_squared_distance;
use crate::update::MIN_GAIN;
use crate::{
    capped_perplexity, fit_transform, Configuration, Initialization, Tsne, TsneError, VectorStore,
};
use approx::assert_abs_diff_eq;
use ndarray::{Array2, Axis};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use std::sync::atomic::{AtomicBool, Ordering};

fn five_vectors() -> Vec<Vec<f64>> {
    vec![
        vec![0.1, 0.2, 0.3, 0.4],
        vec![0.2, 0.1, 0.4, 0.3],
        vec![0.9, 0.8, 0.1, 0.0],
        vec![0.8, 0.9, 0.0, 0.1],
        vec![0.5, 0.5, 0.5, 0.5],
    ]
}

#[test]
fn test_configuration_builder() {
    let config = Configuration::builder()
        .perplexity(5.0)
        .learning_rate(20.0)
        .num_iters(300)
        .build();

    assert_eq!(config.embedding_dimensions, 2);
    assert_eq!(config.perplexity, 5.0);
    assert_eq!(config.learning_rate, 20.0);
    assert_eq!(config.num_iters, 300);
    assert_eq!(config.progress_interval, 50);
    assert!(config.snapshots.is_none());
}

#[test]
fn test_configuration_defaults_agree() {
    let built = Configuration::builder().build();
    let default = Configuration::default();

    assert_eq!(built.embedding_dimensions, default.embedding_dimensions);
    assert_eq!(built.perplexity, default.perplexity);
    assert_eq!(built.num_iters, default.num_iters);
    assert_eq!(built.learning_rate, default.learning_rate);
    assert_eq!(built.progress_interval, default.progress_interval);
    assert!(matches!(
        default.initialization,
        Initialization::Random(None)
    ));
}

#[test]
fn test_capped_perplexity() {
    assert_eq!(capped_perplexity(30.0, 8), 7.0);
    assert_eq!(capped_perplexity(5.0, 8), 5.0);
    assert_eq!(capped_perplexity(5.0, 0), 0.0);
}

#[test]
fn test_small_end_to_end() {
    let tsne = Tsne::new(
        Configuration::builder()
            .perplexity(2.0)
            .embedding_dimensions(2)
            .num_iters(100)
            .build(),
    );
    tsne.initialize(&five_vectors()).unwrap();

    let p = tsne.joint_probabilities().unwrap();
    assert_abs_diff_eq!(p.sum(), 1.0, epsilon = 1e-9);

    let embedding = tsne.run().unwrap();
    assert_eq!(embedding.coordinates.shape(), &[5, 2]);
    assert!(embedding.coordinates.iter().all(|v| v.is_finite()));
    assert_eq!(embedding.iterations, 100);
    assert!(!embedding.cancelled);
    assert!(embedding.snapshots.is_none());
}

#[test]
fn test_rejects_invalid_input() {
    let tsne = Tsne::new(Configuration::builder().perplexity(2.0).build());

    let single = vec![vec![1.0, 2.0]];
    assert!(matches!(
        tsne.initialize(&single),
        Err(TsneError::InsufficientData { n: 1 })
    ));

    let ragged = vec![vec![1.0, 2.0], vec![1.0], vec![0.0, 0.0]];
    assert!(matches!(
        tsne.initialize(&ragged),
        Err(TsneError::DimensionMismatch { index: 1, .. })
    ));

    // Perplexity must be strictly smaller than N.
    let two = vec![vec![1.0, 2.0], vec![2.0, 1.0]];
    assert!(matches!(
        tsne.initialize(&two),
        Err(TsneError::InvalidPerplexity { n: 2, .. })
    ));
}

#[test]
fn test_rejects_non_finite_input() {
    let tsne = Tsne::new(Configuration::builder().perplexity(2.0).build());

    let mut vectors = five_vectors();
    vectors[2][1] = f64::NAN;
    assert!(matches!(
        tsne.initialize(&vectors),
        Err(TsneError::NonFiniteInput { row: 2, column: 1 })
    ));
    assert!(matches!(tsne.is_initialized(), Ok(false)));

    let mut x = Array2::from_shape_fn((5, 3), |(i, j)| (i + j) as f64);
    x[[4, 0]] = f64::INFINITY;
    let config = Configuration::builder().perplexity(2.0).build();
    assert!(matches!(
        fit_transform(x.view(), config),
        Err(TsneError::NonFiniteInput { row: 4, column: 0 })
    ));
}

#[test]
fn test_rejects_non_finite_initialization() {
    let mut start = Array2::zeros((5, 2));
    start[[3, 1]] = f64::NAN;
    let tsne = Tsne::new(
        Configuration::builder()
            .perplexity(2.0)
            .initialization(Initialization::Value(start))
            .build(),
    );

    assert!(matches!(
        tsne.initialize(&five_vectors()),
        Err(TsneError::NonFiniteInitialization { row: 3, column: 1 })
    ));
    assert!(matches!(tsne.run(), Err(TsneError::NotInitialized)));
}

#[test]
fn test_two_identical_vectors() {
    let tsne = Tsne::new(
        Configuration::builder()
            .perplexity(1.5)
            .num_iters(50)
            .initialization(Initialization::Random(Some(3)))
            .build(),
    );
    tsne.initialize(&[vec![0.5, 0.5, 0.5], vec![0.5, 0.5, 0.5]])
        .unwrap();

    let p = tsne.joint_probabilities().unwrap();
    assert_abs_diff_eq!(p[[0, 1]], 0.5, epsilon = 1e-15);
    assert_abs_diff_eq!(p[[1, 0]], 0.5, epsilon = 1e-15);

    let embedding = tsne.run().unwrap();
    assert!(embedding.coordinates.iter().all(|v| v.is_finite()));
}

#[test]
fn test_identical_vectors() {
    let vectors = vec![vec![1.0, -1.0, 2.0]; 6];
    let tsne = Tsne::new(
        Configuration::builder()
            .perplexity(3.0)
            .num_iters(50)
            .build(),
    );
    tsne.initialize(&vectors).unwrap();

    let p = tsne.joint_probabilities().unwrap();
    for i in 0..6 {
        for j in 0..6 {
            let expected = if i == j { 0.0 } else { 1.0 / 30.0 };
            assert_abs_diff_eq!(p[[i, j]], expected, epsilon = 1e-12);
        }
    }

    let embedding = tsne.run().unwrap();
    assert!(embedding.coordinates.iter().all(|v| v.is_finite()));
}

#[test]
fn test_seeded_runs_are_bit_identical() {
    let mut rng = Pcg64Mcg::seed_from_u64(17);
    let x = Array2::random_using((30, 8), Uniform::new(-1.0, 1.0), &mut rng);

    let config = Configuration::builder()
        .perplexity(8.0)
        .num_iters(150)
        .initialization(Initialization::Random(Some(42)))
        .build();

    let a = fit_transform(x.view(), config.clone()).unwrap();
    let b = fit_transform(x.view(), config).unwrap();

    assert!(a
        .coordinates
        .iter()
        .zip(b.coordinates.iter())
        .all(|(u, v)| u.to_bits() == v.to_bits()));
}

#[test]
fn test_gains_stay_above_floor() {
    let mut rng = Pcg64Mcg::seed_from_u64(2);
    let x = Array2::random_using((20, 5), Uniform::new(0.0, 1.0), &mut rng);
    let rows: Vec<Vec<f64>> = x.rows().into_iter().map(|row| row.to_vec()).collect();

    let tsne = Tsne::new(
        Configuration::builder()
            .perplexity(5.0)
            .num_iters(300)
            .build(),
    );
    tsne.initialize_with_rng(&rows, &mut rng).unwrap();

    let mut steps = tsne.steps().unwrap();
    while steps.next().is_some() {
        assert!(steps.state().gains().iter().all(|&g| g >= MIN_GAIN));
    }
}

#[test]
fn test_cancellation_returns_last_completed_state() {
    let tsne = Tsne::new(
        Configuration::builder()
            .perplexity(2.0)
            .num_iters(500)
            .initialization(Initialization::Random(Some(8)))
            .build(),
    );
    tsne.initialize(&five_vectors()).unwrap();

    let cancel = AtomicBool::new(false);
    let mut reports = Vec::new();
    let embedding = tsne
        .run_with(&cancel, |current, total| {
            reports.push((current, total));
            if current == 100 {
                cancel.store(true, Ordering::Relaxed);
            }
        })
        .unwrap();

    assert!(embedding.cancelled);
    assert_eq!(embedding.iterations, 100);
    assert_eq!(reports, vec![(50, 500), (100, 500)]);
    assert!(embedding.coordinates.iter().all(|v| v.is_finite()));

    // The returned coordinates are the state the engine kept.
    assert_eq!(
        tsne.state().unwrap().coordinates(),
        embedding.coordinates.view()
    );
}

#[test]
fn test_progress_reports_final_iteration() {
    let tsne = Tsne::new(
        Configuration::builder()
            .perplexity(2.0)
            .num_iters(120)
            .build(),
    );
    tsne.initialize(&five_vectors()).unwrap();

    let mut reports = Vec::new();
    tsne.run_with(&AtomicBool::new(false), |current, total| {
        reports.push((current, total));
    })
    .unwrap();

    assert_eq!(reports, vec![(50, 120), (100, 120), (120, 120)]);
}

#[test]
fn test_reentrant_run_is_rejected() {
    let tsne = Tsne::new(
        Configuration::builder()
            .perplexity(2.0)
            .num_iters(60)
            .build(),
    );
    tsne.initialize(&five_vectors()).unwrap();

    let mut nested = Vec::new();
    let embedding = tsne
        .run_with(&AtomicBool::new(false), |_, _| {
            nested.push(tsne.run().map(|_| ()));
        })
        .unwrap();

    assert_eq!(embedding.iterations, 60);
    assert_eq!(nested.len(), 2);
    assert!(nested
        .iter()
        .all(|result| matches!(result, Err(TsneError::AlreadyRunning))));
}

#[test]
fn test_snapshots() {
    let config = Configuration::builder()
        .perplexity(2.0)
        .num_iters(100)
        .snapshots(vec![0, 50, 100])
        .initialization(Initialization::Random(Some(4)))
        .build();
    let tsne = Tsne::new(config);
    tsne.initialize(&five_vectors()).unwrap();
    let initial = tsne.state().unwrap().into_coordinates();

    let embedding = tsne.run().unwrap();
    let snapshots = embedding.snapshots.unwrap();

    assert_eq!(snapshots.shape(), &[3, 5, 2]);
    assert_eq!(snapshots.index_axis(Axis(0), 0), initial.view());
    assert_eq!(
        snapshots.index_axis(Axis(0), 2),
        embedding.coordinates.view()
    );
}

#[test]
fn test_fit_transform() {
    // Two well separated clusters.
    let n_per_cluster = 12;
    let n_features = 6;
    let mut rng = Pcg64Mcg::seed_from_u64(99);
    let mut x = Array2::random_using(
        (2 * n_per_cluster, n_features),
        Uniform::new(-0.5, 0.5),
        &mut rng,
    );
    for i in n_per_cluster..2 * n_per_cluster {
        for j in 0..n_features {
            x[[i, j]] += 10.0;
        }
    }

    let config = Configuration::builder()
        .perplexity(5.0)
        .num_iters(1000)
        .initialization(Initialization::Random(Some(7)))
        .build();
    let embedding = fit_transform(x.view(), config).unwrap();
    let y = embedding.coordinates;

    assert_eq!(y.shape(), &[2 * n_per_cluster, 2]);
    assert!(y.iter().all(|v| v.is_finite()));

    let mut intra_cluster_dist = 0.0;
    let mut inter_cluster_dist = 0.0;
    let mut intra_count = 0;
    let mut inter_count = 0;

    for i in 0..y.nrows() {
        for j in (i + 1)..y.nrows() {
            let dist = array_squared_distance(y.row(i), y.row(j)).sqrt();
            if (i / n_per_cluster) == (j / n_per_cluster) {
                intra_cluster_dist += dist;
                intra_count += 1;
            } else {
                inter_cluster_dist += dist;
                inter_count += 1;
            }
        }
    }

    intra_cluster_dist /= f64::from(intra_count);
    inter_cluster_dist /= f64::from(inter_count);

    assert!(
        intra_cluster_dist < inter_cluster_dist,
        "Cluster structure not preserved, intra: {}, inter: {}",
        intra_cluster_dist,
        inter_cluster_dist
    );
}

#[test]
fn test_store_reduce() {
    let mut store = VectorStore::new();
    for (i, vector) in five_vectors().into_iter().enumerate() {
        store.add(format!("text {i}"), vector).unwrap();
    }

    let config = Configuration::builder()
        .perplexity(capped_perplexity(5.0, store.len()))
        .embedding_dimensions(3)
        .num_iters(100)
        .initialization(Initialization::Random(Some(1)))
        .build();
    let embedding = store.reduce(config).unwrap();

    for (item, row) in store.items().iter().zip(embedding.coordinates.rows()) {
        assert_eq!(item.reduced(), Some(row.to_vec().as_slice()));
    }

    // Search still ranks by the original vectors.
    let hits = store.search(&[0.1, 0.2, 0.3, 0.4], 1).unwrap();
    assert_eq!(hits[0].payload, "text 0");
}
