//! This package provides the spatial edges of a feed-forward network: convolutional,
//! locally connected and pooling connections between layers of images.
//! Edges own no memory of their own. They are collected in an [`EdgeGraphBuilder`], which
//! resolves weight tying and lays every parameter and gradient out in two flat arenas
//! when it is bound to a [`Backend`].
//!
//! Images are passed around as 2D ndarrays with one row per image in the minibatch and
//! the pixels flattened as `(y, x, channel)`, channel fastest. Convolutions are computed
//! with the im2col technique described here:
//! - <https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster>
//!
//! Example:
//! ```
//! use conv_edges::{CpuBackend, EdgeConfig, EdgeGraphBuilder, EdgeKind};
//! use ndarray::Array2;
//!
//! let mut builder = EdgeGraphBuilder::new();
//! let conv = EdgeConfig::new("conv1", EdgeKind::Convolutional, 3, 3)
//!     .output_channels(8)
//!     .padding(1);
//! let conv = builder.add_edge(conv.build().unwrap()).unwrap();
//! builder.set_image_size(conv, 8, 8).unwrap();
//!
//! let mut graph = builder.bind(CpuBackend::open()).unwrap();
//! graph.weights_mut(conv).unwrap().fill(0.1);
//!
//! // Two images of 8x8 pixels with 3 channels each.
//! let input = Array2::<f32>::ones((2, 8 * 8 * 3));
//! let mut output = Array2::<f32>::zeros((2, 8 * 8 * 8));
//! graph.compute_up(conv, input.view(), output.view_mut(), true).unwrap();
//!
//! println!("{}", graph.edge(conv).unwrap());
//! ```

pub mod backend;
pub mod config;
pub mod conv_edge;
pub mod edge;
pub mod error;
pub mod geometry;
pub mod local_edge;
pub mod memory;
pub mod network;
pub mod optimizer;
pub mod pool_edge;
pub mod weighted;

pub use backend::{Backend, CpuBackend};
pub use config::{EdgeConfig, NetworkConfig};
pub use edge::{Edge, EdgeKind};
pub use error::{EdgeError, Result};
pub use geometry::{FieldOfView, Geometry};
pub use network::{AnyEdge, EdgeGraph, EdgeGraphBuilder, EdgeId};
pub use pool_edge::PoolMode;
pub use weighted::WeightedEdge;

pub type WeightPrecision = f32;
