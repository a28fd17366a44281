use approx::assert_relative_eq;
use meshwarp::{
    canonical_mesh, grid::build_sampling_grid, mask_to_float, transform, MeshWarp, MeshWarpConfig,
    MeshWarpError, SamplingConvention,
};
use meshwarp_tensor::{CpuBackend, Tensor4, Tensor5};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn counting_image() -> Tensor4<f32> {
    Tensor4::from_shape_fn([1, 4, 4, 1], |[_, r, c, _]| (r * 4 + c + 1) as f32)
}

#[test]
fn identity_warp_is_exact_without_regularization() -> Result<(), MeshWarpError> {
    init_logger();
    let config = MeshWarpConfig::new(1, 1, 4, 4)
        .with_regularization(0.0)
        .with_sampling(SamplingConvention::AlignCorners);
    let warp = MeshWarp::new(CpuBackend::new(), config.clone())?;

    let image = counting_image();
    let out = warp.transform(&image, &canonical_mesh(1, &config))?;

    assert_eq!(out.image.shape, [1, 4, 4, 1]);
    for (a, b) in out.image.iter().zip(image.iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-4);
    }
    assert!(out.mask.iter().all(|&m| !m));
    assert!(mask_to_float(&out.mask).iter().all(|&m| m == 0.0));
    Ok(())
}

#[test]
fn identity_warp_with_default_regularization() -> Result<(), MeshWarpError> {
    init_logger();
    let config =
        MeshWarpConfig::new(1, 1, 4, 4).with_sampling(SamplingConvention::AlignCorners);
    let warp = MeshWarp::new(CpuBackend::new(), config.clone())?;

    let image = counting_image();
    let out = warp.transform(&image, &canonical_mesh(1, &config))?;

    for (a, b) in out.image.iter().zip(image.iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-2);
    }

    // the regularization bias pushes the top row and left column just below -1;
    // the right column and bottom row map onto 1 and are decided by rounding
    for k in 0..3 {
        assert_eq!(out.mask.get([0, 0, k]), Some(&true));
        assert_eq!(out.mask.get([0, k, 0]), Some(&true));
    }
    for r in 1..=2 {
        for c in 1..=2 {
            assert_eq!(out.mask.get([0, r, c]), Some(&false));
        }
    }
    Ok(())
}

#[test]
fn coordinates_follow_the_mesh() -> Result<(), MeshWarpError> {
    init_logger();
    let config = MeshWarpConfig::new(1, 1, 3, 3).with_regularization(0.0);
    let warp = MeshWarp::new(CpuBackend::new(), config.clone())?;

    // translate the whole mesh by +0.5 in x
    let mut theta = canonical_mesh(1, &config);
    theta
        .as_slice_mut()
        .iter_mut()
        .step_by(2)
        .for_each(|x| *x += 0.5);

    let image = Tensor4::from_shape_fn([1, 3, 3, 1], |[_, r, c, _]| (r * 3 + c) as f32);
    let out = warp.transform(&image, &theta)?;

    // x samples at -0.5, 0.5 and 1.5; the last column is outside
    let expected_x = [-0.5, 0.5, 1.5];
    for r in 0..3 {
        for (c, expected) in expected_x.iter().enumerate() {
            let x = *out.coords.get([0, r, c, 0]).unwrap();
            assert_relative_eq!(x, *expected, epsilon = 1e-4);
        }
    }
    assert_eq!(out.mask.get([0, 1, 0]), Some(&false));
    assert_eq!(out.mask.get([0, 1, 1]), Some(&false));
    assert_eq!(out.mask.get([0, 1, 2]), Some(&true));
    assert_eq!(out.mask.get([0, 0, 2]), Some(&true));

    // the outside column replicates the right edge of the source
    for r in 0..3 {
        let v = *out.image.get([0, r, 2, 0]).unwrap();
        assert_relative_eq!(v, (r * 3 + 2) as f32, epsilon = 1e-3);
    }
    Ok(())
}

#[test]
fn default_convention_samples_between_pixels() -> Result<(), MeshWarpError> {
    let config = MeshWarpConfig::new(1, 1, 4, 4).with_regularization(0.0);
    assert_eq!(config.sampling, SamplingConvention::Extent);
    let out = transform(
        &CpuBackend::new(),
        &counting_image(),
        &canonical_mesh(1, &config),
        &config,
    )?;

    // x = -1/3 lands on pixel coordinate 4/3
    let v = *out.image.get([0, 0, 1, 0]).unwrap();
    assert_relative_eq!(v, 1.0 + 4.0 / 3.0, epsilon = 1e-3);
    Ok(())
}

#[test]
fn division_guard_keeps_coordinates_finite() -> Result<(), MeshWarpError> {
    let config = MeshWarpConfig::new(1, 1, 5, 5);
    let backend = CpuBackend::new();

    // z = x vanishes on the centre column, z = -x flips its sign
    for sign in [1.0f32, -1.0] {
        let hs = Tensor4::from_shape_vec(
            [1, 1, 1, 9],
            vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, sign, 0.0, 0.0],
        )?;
        let maps = build_sampling_grid(&backend, &hs, &config)?;
        assert!(maps.x_map.iter().all(|v| v.is_finite()));
        assert!(maps.y_map.iter().all(|v| v.is_finite()));

        // bottom row of the centre column: y = 1 over z' = +epsilon
        let y = *maps.y_map.get([0, 4, 2]).unwrap();
        assert!(y > 1e7);

        // left column: z = -sign, so y / z' keeps the sign of z
        let y = *maps.y_map.get([0, 4, 0]).unwrap();
        assert_relative_eq!(y, -sign, epsilon = 1e-6);
    }

    let image = Tensor4::from_shape_val([1, 3, 3, 2], 2.0f32);
    let mut theta = canonical_mesh(1, &config);
    theta.as_slice_mut().iter_mut().for_each(|v| *v = 0.0);
    let out = transform(&backend, &image, &theta, &config)?;
    assert!(out.image.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn batch_transform_replicates_sources() -> Result<(), MeshWarpError> {
    init_logger();
    let config = MeshWarpConfig::new(2, 2, 6, 6);
    let warp = MeshWarp::new(CpuBackend::new(), config.clone())?;
    let mut rng = StdRng::seed_from_u64(7);

    let image = Tensor4::from_shape_fn([2, 8, 8, 3], |[b, r, c, ch]| {
        (b * 100 + r * 8 + c) as f32 + ch as f32 * 0.5
    });

    let canonical = canonical_mesh(1, &config);
    let per_theta = canonical.numel();
    let mut data = Vec::with_capacity(2 * 3 * per_theta);
    for _ in 0..2 * 3 {
        data.extend(
            canonical
                .iter()
                .map(|v| v * 0.9 + rng.random_range(-0.05..0.05)),
        );
    }
    let thetas = Tensor5::from_shape_vec([2, 3, 3, 3, 2], data.clone())?;

    let out = warp.batch_transform(&image, &thetas)?;
    assert_eq!(out.image.shape, [6, 6, 6, 3]);
    assert_eq!(out.mask.shape, [6, 6, 6]);

    // output 4 is source 1 warped by thetas[1, 1]
    let single_image = Tensor4::from_shape_slice(
        [1, 8, 8, 3],
        &image.as_slice()[8 * 8 * 3..],
    )?;
    let single_theta = Tensor4::from_shape_slice(
        [1, 3, 3, 2],
        &data[4 * per_theta..5 * per_theta],
    )?;
    let single = warp.transform(&single_image, &single_theta)?;

    let plane = 6 * 6 * 3;
    assert_eq!(
        &out.image.as_slice()[4 * plane..5 * plane],
        single.image.as_slice()
    );

    let wrong = Tensor5::<f32>::zeros([3, 1, 3, 3, 2]);
    assert!(warp.batch_transform(&image, &wrong).is_err());
    Ok(())
}

#[test]
fn config_from_json_drives_the_warp() -> Result<(), MeshWarpError> {
    let config = MeshWarpConfig::from_json_str(
        r#"{ "grid_h": 2, "grid_w": 3, "height": 4, "width": 6, "regularization": 0.0 }"#,
    )?;
    let warp = MeshWarp::new(CpuBackend::new(), config.clone())?;
    assert_eq!(warp.config(), &config);

    let image = Tensor4::from_shape_val([1, 4, 6, 1], 3.0f32);
    let out = warp.transform(&image, &canonical_mesh(1, &config))?;
    for v in out.image.iter() {
        assert_relative_eq!(*v, 3.0, epsilon = 1e-5);
    }
    Ok(())
}

/// loss = sum(out * weights) for a random displaced mesh
#[test]
fn transform_gradients_match_finite_differences() -> Result<(), MeshWarpError> {
    init_logger();
    let config = MeshWarpConfig::new(2, 2, 6, 6);
    let warp = MeshWarp::new(CpuBackend::new(), config.clone())?;
    let mut rng = StdRng::seed_from_u64(42);

    // linear in the pixel position, so bilinear sampling is smooth in the coordinates;
    // the shrunken mesh keeps every sample inside the last pixel centre
    let image = Tensor4::from_shape_fn([1, 8, 8, 2], |[_, r, c, ch]| {
        0.3 * r as f32 + 0.7 * c as f32 + ch as f32 * (0.2 * c as f32 - 0.1 * r as f32)
    });

    let mut theta = canonical_mesh(1, &config);
    for v in theta.as_slice_mut() {
        *v = *v * 0.6 + rng.random_range(-0.05..0.05);
    }

    let weights = Tensor4::from_shape_fn([1, 6, 6, 2], |[_, r, c, ch]| {
        ((r * 5 + c * 3 + ch) % 7) as f32 / 7.0 - 0.4
    });

    let loss = |image: &Tensor4<f32>, theta: &Tensor4<f32>| -> Result<f64, MeshWarpError> {
        let out = warp.transform(image, theta)?;
        Ok(out
            .image
            .iter()
            .zip(weights.iter())
            .map(|(a, w)| (*a as f64) * (*w as f64))
            .sum())
    };

    let (out, tape) = warp.transform_with_tape(&image, &theta)?;
    assert!(out.mask.iter().all(|&m| !m));
    let grads = warp.backward(&tape, &weights, None)?;

    let step = 1e-3f32;
    for k in 0..theta.numel() {
        let (mut plus, mut minus) = (theta.clone(), theta.clone());
        plus.as_slice_mut()[k] += step;
        minus.as_slice_mut()[k] -= step;
        let numeric = ((loss(&image, &plus)? - loss(&image, &minus)?) / (2.0 * step as f64)) as f32;
        assert_relative_eq!(
            grads.theta.as_slice()[k],
            numeric,
            epsilon = 5e-2,
            max_relative = 5e-2
        );
    }

    // the warp is linear in the image
    let lhs = loss(&image, &theta)?;
    let rhs: f64 = image
        .iter()
        .zip(grads.image.iter())
        .map(|(a, g)| (*a as f64) * (*g as f64))
        .sum();
    assert_relative_eq!(lhs, rhs, epsilon = 1e-3, max_relative = 1e-4);
    Ok(())
}

#[test]
fn coordinate_cotangent_reaches_theta() -> Result<(), MeshWarpError> {
    let config = MeshWarpConfig::new(1, 1, 4, 4).with_regularization(0.0);
    let warp = MeshWarp::new(CpuBackend::new(), config.clone())?;

    let image = Tensor4::from_shape_val([1, 4, 4, 1], 1.0f32);
    let (_, tape) = warp.transform_with_tape(&image, &canonical_mesh(1, &config))?;

    // d(sum x_map)/d theta: translating the whole mesh in x moves every sample
    let grad_output = Tensor4::<f32>::zeros([1, 4, 4, 1]);
    let grad_coords = Tensor4::from_shape_fn([1, 4, 4, 2], |[_, _, _, k]| {
        if k == 0 {
            1.0
        } else {
            0.0
        }
    });
    let grads = warp.backward(&tape, &grad_output, Some(&grad_coords))?;

    let sum_x: f32 = grads.theta.iter().step_by(2).sum();
    let sum_y: f32 = grads.theta.iter().skip(1).step_by(2).sum();
    assert_relative_eq!(sum_x, 16.0, epsilon = 1e-3);
    assert_relative_eq!(sum_y, 0.0, epsilon = 1e-3);
    Ok(())
}
