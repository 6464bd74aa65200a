// Graph-level tests: binding, tying, gradient accumulation and resizing.

use approx::assert_abs_diff_eq;
use conv_edges::{
    AnyEdge, CpuBackend, EdgeConfig, EdgeError, EdgeGraph, EdgeGraphBuilder, EdgeId, EdgeKind, FieldOfView,
    PoolMode,
};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
}

fn conv(name: &str, cin: usize, cout: usize, kernel: usize, stride: usize, padding: usize) -> EdgeConfig {
    EdgeConfig::new(name, EdgeKind::Convolutional, kernel, cin)
        .output_channels(cout)
        .stride(stride)
        .padding(padding)
}

fn add(builder: &mut EdgeGraphBuilder, config: EdgeConfig, size: usize) -> EdgeId {
    let id = builder.add_edge(config.build().unwrap()).unwrap();
    builder.set_image_size(id, size, size).unwrap();
    id
}

fn randomize(graph: &mut EdgeGraph<CpuBackend>, rng: &mut StdRng) {
    for value in graph.parameters_mut().as_mut_slice().iter_mut() {
        *value = rng.gen_range(-0.5..0.5);
    }
}

fn assert_close(a: &Array2<f32>, b: &Array2<f32>) {
    assert_eq!(a.dim(), b.dim());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-4);
    }
}

#[test]
fn tied_edge_owns_no_memory_and_computes_identically() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut builder = EdgeGraphBuilder::new();
    let owner = add(&mut builder, conv("conv1", 3, 4, 3, 1, 1), 8);
    let tied = add(&mut builder, conv("conv1_copy", 3, 4, 3, 1, 1), 8);
    builder.tie(tied, owner).unwrap();

    let mut graph = builder.bind(CpuBackend::open()).unwrap();
    assert_eq!(graph.edge(tied).unwrap().as_edge().parameter_memory_requirement().unwrap(), 0);
    assert_eq!(graph.parameters().len(), 4 * 27 + 4);
    assert_eq!(graph.owner(tied).unwrap(), owner);
    randomize(&mut graph, &mut rng);

    let input = random(&mut rng, 2, 8 * 8 * 3);
    let mut a = Array2::zeros((2, 8 * 8 * 4));
    let mut b = Array2::zeros((2, 8 * 8 * 4));
    graph.compute_up(owner, input.view(), a.view_mut(), true).unwrap();
    graph.compute_up(tied, input.view(), b.view_mut(), true).unwrap();
    assert_eq!(a, b);
    assert_eq!(graph.weights(owner).unwrap(), graph.weights(tied).unwrap());
}

#[test]
fn partial_sums_match_direct_gradient() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut builder = EdgeGraphBuilder::new();
    let ids: Vec<EdgeId> = [0, 1, 2, 3, 8]
        .iter()
        .map(|&ps| {
            let config = conv(&format!("conv_ps{}", ps), 3, 4, 3, 1, 1).partial_sum(ps);
            add(&mut builder, config, 8)
        })
        .collect();
    let mut graph = builder.bind(CpuBackend::open()).unwrap();

    let input = random(&mut rng, 4, 8 * 8 * 3);
    let deriv_output = random(&mut rng, 4, 8 * 8 * 4);
    for &id in ids.iter() {
        graph.compute_outer(id, input.view(), deriv_output.view()).unwrap();
    }

    let direct = graph.grad_weights(ids[0]).unwrap().to_owned();
    let direct_bias = graph.grad_bias(ids[0]).unwrap().unwrap().to_owned();
    for &id in ids[1..].iter() {
        assert_close(&graph.grad_weights(id).unwrap().to_owned(), &direct);
        assert_close(&graph.grad_bias(id).unwrap().unwrap().to_owned(), &direct_bias);
    }
}

#[test]
fn second_gradient_accumulates_until_reset() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut builder = EdgeGraphBuilder::new();
    let id = add(&mut builder, conv("conv1", 2, 3, 3, 2, 1).partial_sum(2), 6);
    let mut graph = builder.bind(CpuBackend::open()).unwrap();

    let modules = 3 * 3;
    let input = random(&mut rng, 3, 6 * 6 * 2);
    let deriv_output = random(&mut rng, 3, modules * 3);

    graph.compute_outer(id, input.view(), deriv_output.view()).unwrap();
    let once = graph.grad_weights(id).unwrap().to_owned();
    assert_eq!(graph.num_grads_received(id).unwrap(), 1);

    graph.compute_outer(id, input.view(), deriv_output.view()).unwrap();
    assert_eq!(graph.num_grads_received(id).unwrap(), 2);
    assert_close(&graph.grad_weights(id).unwrap().to_owned(), &(&once * 2.0));

    graph.reset_gradients();
    assert_eq!(graph.num_grads_received(id).unwrap(), 0);
    graph.compute_outer(id, input.view(), deriv_output.view()).unwrap();
    assert_close(&graph.grad_weights(id).unwrap().to_owned(), &once);
}

#[test]
fn tied_edges_share_one_gradient_counter() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut builder = EdgeGraphBuilder::new();
    let owner = add(&mut builder, conv("conv1", 3, 4, 3, 1, 1), 8);
    let tied = add(&mut builder, conv("conv2", 3, 4, 3, 1, 1), 8);
    builder.tie(tied, owner).unwrap();
    let mut graph = builder.bind(CpuBackend::open()).unwrap();

    let input = random(&mut rng, 2, 8 * 8 * 3);
    let deriv_output = random(&mut rng, 2, 8 * 8 * 4);

    graph.compute_outer(owner, input.view(), deriv_output.view()).unwrap();
    let once = graph.grad_weights(owner).unwrap().to_owned();
    let once_bias = graph.grad_bias(owner).unwrap().unwrap().to_owned();

    graph.compute_outer(tied, input.view(), deriv_output.view()).unwrap();
    assert_eq!(graph.num_grads_received(owner).unwrap(), 2);
    assert_eq!(graph.num_grads_received(tied).unwrap(), 2);
    assert_close(&graph.grad_weights(owner).unwrap().to_owned(), &(&once * 2.0));
    assert_close(&graph.grad_bias(tied).unwrap().unwrap().to_owned(), &(&once_bias * 2.0));
}

#[test]
fn shared_bias_broadcasts_over_locations() {
    let mut builder = EdgeGraphBuilder::new();
    let shared = add(&mut builder, conv("shared", 1, 2, 3, 1, 1), 4);
    let unshared = add(&mut builder, conv("unshared", 1, 2, 3, 1, 1).shared_bias(false), 4);
    let mut graph = builder.bind(CpuBackend::open()).unwrap();
    assert_eq!(graph.bias(shared).unwrap().unwrap().dim(), (1, 2));
    assert_eq!(graph.bias(unshared).unwrap().unwrap().dim(), (1, 16 * 2));

    {
        let mut bias = graph.bias_mut(shared).unwrap().unwrap();
        bias[[0, 0]] = 1.0;
        bias[[0, 1]] = -2.0;
    }
    {
        let mut bias = graph.bias_mut(unshared).unwrap().unwrap();
        for (i, value) in bias.iter_mut().enumerate() {
            *value = i as f32;
        }
    }

    let input = Array2::ones((1, 16));
    let mut output = Array2::zeros((1, 16 * 2));
    graph.compute_up(shared, input.view(), output.view_mut(), true).unwrap();
    for location in 0..16 {
        assert_eq!(output[[0, location * 2]], 1.0);
        assert_eq!(output[[0, location * 2 + 1]], -2.0);
    }

    graph.compute_up(unshared, input.view(), output.view_mut(), true).unwrap();
    for (i, value) in output.iter().enumerate() {
        assert_eq!(*value, i as f32);
    }
}

#[test]
fn local_bias_gradient_is_batch_mean() {
    let mut rng = StdRng::seed_from_u64(13);
    let mut builder = EdgeGraphBuilder::new();
    let local = EdgeConfig::new("local1", EdgeKind::LocallyConnected, 3, 2).output_channels(3);
    let id = add(&mut builder, local, 5);
    let mut graph = builder.bind(CpuBackend::open()).unwrap();
    assert_eq!(graph.parameters().len(), 3 * 9 * 18 + 9 * 3);

    let input = random(&mut rng, 4, 5 * 5 * 2);
    let deriv_output = random(&mut rng, 4, 9 * 3);
    graph.compute_outer(id, input.view(), deriv_output.view()).unwrap();

    let mean = deriv_output.mean_axis(ndarray::Axis(0)).unwrap().insert_axis(ndarray::Axis(0));
    assert_close(&graph.grad_bias(id).unwrap().unwrap().to_owned(), &mean);
}

#[test]
fn no_bias_edge_has_only_weights() {
    let mut builder = EdgeGraphBuilder::new();
    let id = add(&mut builder, conv("conv1", 3, 4, 3, 1, 1).no_bias(), 8);
    let graph = builder.bind(CpuBackend::open()).unwrap();
    assert_eq!(graph.parameters().len(), 4 * 27);
    assert!(graph.bias(id).unwrap().is_none());
    assert!(graph.grad_bias(id).unwrap().is_none());
}

#[test]
fn pooling_has_no_parameters() {
    let mut builder = EdgeGraphBuilder::new();
    let max = add(
        &mut builder,
        EdgeConfig::new("max", EdgeKind::Pooling, 2, 1).stride(2),
        4,
    );
    let avg = add(
        &mut builder,
        EdgeConfig::new("avg", EdgeKind::Pooling, 2, 1)
            .stride(2)
            .pool_mode(PoolMode::Avg),
        4,
    );
    let mut graph = builder.bind(CpuBackend::open()).unwrap();
    assert!(graph.parameters().is_empty());
    assert!(graph.weights(max).is_err());

    let input = Array2::from_shape_fn((1, 16), |(_, c)| c as f32);
    let mut output = Array2::zeros((1, 4));
    graph.compute_up(max, input.view(), output.view_mut(), true).unwrap();
    assert_eq!(output.row(0).to_vec(), vec![5.0, 7.0, 13.0, 15.0]);

    let deriv_output = Array2::ones((1, 4));
    let mut deriv_input = Array2::zeros((1, 16));
    graph
        .compute_down(max, deriv_output.view(), input.view(), output.view(), deriv_input.view_mut(), true)
        .unwrap();
    assert_eq!(deriv_input.sum(), 4.0);
    assert_eq!(deriv_input[[0, 5]], 1.0);
    assert_eq!(deriv_input[[0, 0]], 0.0);

    graph.compute_up(avg, input.view(), output.view_mut(), true).unwrap();
    assert_eq!(output.row(0).to_vec(), vec![2.5, 4.5, 10.5, 12.5]);

    graph.compute_outer(avg, input.view(), deriv_output.view()).unwrap();
    assert!(graph.num_grads_received(avg).is_err());
}

#[test]
fn tying_across_kinds_is_rejected() {
    let mut builder = EdgeGraphBuilder::new();
    let conv1 = add(&mut builder, conv("conv1", 3, 4, 3, 1, 1), 8);
    let local = add(
        &mut builder,
        EdgeConfig::new("local1", EdgeKind::LocallyConnected, 3, 3).output_channels(4),
        8,
    );
    match builder.tie(local, conv1) {
        Err(EdgeError::IncompatibleTie { edge, kind, target, target_kind }) => {
            assert_eq!(edge, "local1");
            assert_eq!(kind, EdgeKind::LocallyConnected);
            assert_eq!(target, "conv1");
            assert_eq!(target_kind, EdgeKind::Convolutional);
        }
        other => panic!("expected an incompatible tie, got {:?}", other),
    }
    assert!(builder.tie(conv1, conv1).is_err());
}

#[test]
fn tie_cycles_and_shape_mismatches_fail_to_bind() {
    let mut builder = EdgeGraphBuilder::new();
    let a = add(&mut builder, conv("a", 3, 4, 3, 1, 1), 8);
    let b = add(&mut builder, conv("b", 3, 4, 3, 1, 1), 8);
    builder.tie(a, b).unwrap();
    builder.tie(b, a).unwrap();
    assert!(matches!(
        builder.bind(CpuBackend::open()),
        Err(EdgeError::Configuration(_))
    ));

    let mut builder = EdgeGraphBuilder::new();
    let a = add(&mut builder, conv("a", 3, 8, 3, 1, 1), 8);
    let b = add(&mut builder, conv("b", 3, 4, 3, 1, 1), 8);
    builder.tie(b, a).unwrap();
    assert!(builder.bind(CpuBackend::open()).is_err());
}

#[test]
fn tie_chains_resolve_to_the_owner() {
    let mut builder = EdgeGraphBuilder::new();
    let a = add(&mut builder, conv("a", 3, 4, 3, 1, 1), 8);
    let b = add(&mut builder, conv("b", 3, 4, 3, 1, 1), 8);
    let c = add(&mut builder, conv("c", 3, 4, 3, 1, 1), 8);
    builder.tie(c, b).unwrap();
    builder.tie(b, a).unwrap();
    let graph = builder.bind(CpuBackend::open()).unwrap();
    assert_eq!(graph.owner(c).unwrap(), a);
    assert_eq!(graph.parameters().len(), 4 * 27 + 4);
}

#[test]
fn resizing_after_bind_keeps_parameter_shape() {
    let mut rng = StdRng::seed_from_u64(17);
    let mut builder = EdgeGraphBuilder::new();
    let shared = add(&mut builder, conv("shared", 1, 2, 3, 1, 1), 4);
    let unshared = add(&mut builder, conv("unshared", 1, 2, 3, 1, 1).shared_bias(false), 4);
    let mut graph = builder.bind(CpuBackend::open()).unwrap();

    graph.set_image_size(shared, 6, 6).unwrap();
    let input = random(&mut rng, 1, 36);
    let mut output = Array2::zeros((1, 36 * 2));
    graph.compute_up(shared, input.view(), output.view_mut(), true).unwrap();

    assert!(graph.set_image_size(unshared, 6, 6).is_err());
    let spatial = graph.edge(unshared).unwrap().as_edge().base().spatial().unwrap();
    assert_eq!((spatial.image_size_y, spatial.image_size_x), (4, 4));
}

#[test]
fn field_of_view_walks_chain_backwards() {
    let mut builder = EdgeGraphBuilder::new();
    let first = add(&mut builder, conv("first", 1, 1, 3, 1, 1), 8);
    let second = add(&mut builder, conv("second", 1, 1, 3, 2, 1), 8);
    let graph = builder.bind(CpuBackend::open()).unwrap();

    assert_eq!(
        graph.field_of_view(&[second]).unwrap(),
        FieldOfView {
            size: 3,
            sep: 2,
            pad1: 1,
            pad2: 0
        }
    );
    assert_eq!(
        graph.field_of_view(&[first, second]).unwrap(),
        FieldOfView {
            size: 5,
            sep: 2,
            pad1: 2,
            pad2: 1
        }
    );
}

#[test]
fn unsized_weighted_edge_fails_to_bind() {
    let mut builder = EdgeGraphBuilder::new();
    let edge = conv("conv1", 3, 4, 3, 1, 1).shared_bias(false).build().unwrap();
    assert!(matches!(edge, AnyEdge::Convolutional(_)));
    builder.add_edge(edge).unwrap();
    assert!(matches!(
        builder.bind(CpuBackend::open()),
        Err(EdgeError::ImageSizeUnset(_))
    ));
}

#[test]
fn duplicate_names_are_rejected() {
    let mut builder = EdgeGraphBuilder::new();
    builder.add_edge(conv("conv1", 3, 4, 3, 1, 1).build().unwrap()).unwrap();
    assert!(builder.add_edge(conv("conv1", 3, 4, 3, 1, 1).build().unwrap()).is_err());
}

#[test]
fn tied_local_edges_share_parameters_and_gradient() {
    let mut rng = StdRng::seed_from_u64(19);
    let local = |name: &str| EdgeConfig::new(name, EdgeKind::LocallyConnected, 3, 2).output_channels(3);
    let mut builder = EdgeGraphBuilder::new();
    let owner = add(&mut builder, local("local1"), 5);
    let tied = add(&mut builder, local("local1_copy"), 5);
    builder.tie(tied, owner).unwrap();

    let mut graph = builder.bind(CpuBackend::open()).unwrap();
    assert_eq!(graph.parameters().len(), 3 * 9 * 18 + 9 * 3);
    randomize(&mut graph, &mut rng);

    let input = random(&mut rng, 2, 5 * 5 * 2);
    let mut a = Array2::zeros((2, 9 * 3));
    let mut b = Array2::zeros((2, 9 * 3));
    graph.compute_up(owner, input.view(), a.view_mut(), true).unwrap();
    graph.compute_up(tied, input.view(), b.view_mut(), true).unwrap();
    assert_eq!(a, b);

    let deriv_output = random(&mut rng, 2, 9 * 3);
    graph.compute_outer(tied, input.view(), deriv_output.view()).unwrap();
    let once = graph.grad_weights(owner).unwrap().to_owned();
    graph.compute_outer(owner, input.view(), deriv_output.view()).unwrap();
    assert_eq!(graph.num_grads_received(tied).unwrap(), 2);
    assert_close(&graph.grad_weights(tied).unwrap().to_owned(), &(&once * 2.0));
}

#[test]
fn compute_down_is_adjoint_of_compute_up() {
    let mut rng = StdRng::seed_from_u64(23);
    let mut builder = EdgeGraphBuilder::new();
    let id = add(&mut builder, conv("conv1", 2, 3, 3, 2, 1).no_bias(), 6);
    let mut graph = builder.bind(CpuBackend::open()).unwrap();
    randomize(&mut graph, &mut rng);

    let input = random(&mut rng, 2, 6 * 6 * 2);
    let deriv_output = random(&mut rng, 2, 3 * 3 * 3);
    let mut output = Array2::zeros((2, 3 * 3 * 3));
    graph.compute_up(id, input.view(), output.view_mut(), true).unwrap();

    let mut deriv_input = Array2::zeros((2, 6 * 6 * 2));
    graph
        .compute_down(id, deriv_output.view(), input.view(), output.view(), deriv_input.view_mut(), true)
        .unwrap();
    let forward: f32 = (&output * &deriv_output).sum();
    let backward: f32 = (&input * &deriv_input).sum();
    assert_abs_diff_eq!(forward, backward, epsilon = 1e-3);

    let once = deriv_input.clone();
    graph
        .compute_down(id, deriv_output.view(), input.view(), output.view(), deriv_input.view_mut(), false)
        .unwrap();
    assert_close(&deriv_input, &(&once * 2.0));
}

#[test]
fn partial_sums_on_rectangular_grid() {
    let mut rng = StdRng::seed_from_u64(29);
    let mut builder = EdgeGraphBuilder::new();
    let ids: Vec<EdgeId> = [0, 2, 4]
        .iter()
        .map(|&ps| {
            let config = conv(&format!("wide_ps{}", ps), 2, 3, 3, 1, 1).partial_sum(ps);
            let id = builder.add_edge(config.build().unwrap()).unwrap();
            builder.set_image_size(id, 6, 9).unwrap();
            id
        })
        .collect();
    let mut graph = builder.bind(CpuBackend::open()).unwrap();
    let spatial = graph.edge(ids[0]).unwrap().as_edge().base().spatial().unwrap();
    assert_eq!((spatial.num_modules_y, spatial.num_modules_x), (6, 9));

    let input = random(&mut rng, 3, 6 * 9 * 2);
    let deriv_output = random(&mut rng, 3, 6 * 9 * 3);
    for &id in ids.iter() {
        graph.compute_outer(id, input.view(), deriv_output.view()).unwrap();
    }
    let direct = graph.grad_weights(ids[0]).unwrap().to_owned();
    for &id in ids[1..].iter() {
        assert_close(&graph.grad_weights(id).unwrap().to_owned(), &direct);
    }
}
