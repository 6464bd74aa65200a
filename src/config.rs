//! Declarative edge configuration.
//!
//! A network is described as a list of edges in JSON:
//!
//! ```json
//! {
//!   "edges": [
//!     { "name": "conv1", "kind": "conv", "kernel_size": 3, "padding": 1,
//!       "num_input_channels": 3, "num_output_channels": 16,
//!       "partial_sum": 4, "image_size": [32, 32] },
//!     { "name": "pool1", "kind": "pool", "pool_mode": "max", "kernel_size": 2,
//!       "stride": 2, "num_input_channels": 16, "image_size": [32, 32] },
//!     { "name": "conv1_mirror", "kind": "conv", "kernel_size": 3, "padding": 1,
//!       "num_input_channels": 3, "num_output_channels": 16,
//!       "tied_to": "conv1", "image_size": [32, 32] }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::conv_edge::ConvolutionalEdge;
use crate::edge::EdgeKind;
use crate::error::{configuration, Result};
use crate::geometry::Geometry;
use crate::local_edge::LocallyConnectedEdge;
use crate::network::AnyEdge;
use crate::pool_edge::{PoolMode, PoolingEdge};
use crate::weighted::WeightState;

fn default_stride() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_scale_gradients() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub name: String,
    pub kind: EdgeKind,
    /// Only read for pooling edges.
    #[serde(default)]
    pub pool_mode: PoolMode,
    pub kernel_size: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default)]
    pub padding: usize,
    pub num_input_channels: usize,
    /// Required for weighted edges. Pooling edges default to their input
    /// channel count and must not differ from it.
    #[serde(default)]
    pub num_output_channels: Option<usize>,
    /// Partial-sum tile side for convolution weight gradients, 0 disables.
    #[serde(default)]
    pub partial_sum: usize,
    #[serde(default = "default_true")]
    pub shared_bias: bool,
    #[serde(default)]
    pub has_no_bias: bool,
    #[serde(default = "default_scale_gradients")]
    pub scale_gradients: f32,
    #[serde(default)]
    pub tied_to: Option<String>,
    /// Input image `[height, width]`, when known up front.
    #[serde(default)]
    pub image_size: Option<[usize; 2]>,
}

impl EdgeConfig {
    pub fn new(name: &str, kind: EdgeKind, kernel_size: usize, num_input_channels: usize) -> EdgeConfig {
        EdgeConfig {
            name: name.to_string(),
            kind,
            pool_mode: PoolMode::default(),
            kernel_size,
            stride: default_stride(),
            padding: 0,
            num_input_channels,
            num_output_channels: None,
            partial_sum: 0,
            shared_bias: true,
            has_no_bias: false,
            scale_gradients: default_scale_gradients(),
            tied_to: None,
            image_size: None,
        }
    }

    pub fn output_channels(mut self, num_output_channels: usize) -> Self {
        self.num_output_channels = Some(num_output_channels);
        self
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn partial_sum(mut self, partial_sum: usize) -> Self {
        self.partial_sum = partial_sum;
        self
    }

    pub fn shared_bias(mut self, shared_bias: bool) -> Self {
        self.shared_bias = shared_bias;
        self
    }

    pub fn no_bias(mut self) -> Self {
        self.has_no_bias = true;
        self
    }

    pub fn pool_mode(mut self, mode: PoolMode) -> Self {
        self.pool_mode = mode;
        self
    }

    pub fn tied_to(mut self, name: &str) -> Self {
        self.tied_to = Some(name.to_string());
        self
    }

    pub fn image_size(mut self, image_size_y: usize, image_size_x: usize) -> Self {
        self.image_size = Some([image_size_y, image_size_x]);
        self
    }

    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(self.kernel_size, self.stride, self.padding)
    }

    /// Builds the (untied, unsized) edge this entry describes.
    pub fn build(&self) -> Result<AnyEdge> {
        let geometry = self.geometry()?;
        let weights = WeightState::new(self.has_no_bias, self.scale_gradients);
        let edge = match self.kind {
            EdgeKind::Convolutional => AnyEdge::Convolutional(
                ConvolutionalEdge::new(&self.name, self.num_input_channels, self.weighted_outputs()?, geometry)?
                    .with_partial_sum(self.partial_sum)
                    .with_shared_bias(self.shared_bias)
                    .with_weight_state(weights),
            ),
            EdgeKind::LocallyConnected => {
                if self.partial_sum != 0 {
                    return Err(configuration(format!(
                        "locally connected edge `{}` does not support partial sums",
                        self.name
                    )));
                }
                AnyEdge::LocallyConnected(
                    LocallyConnectedEdge::new(
                        &self.name,
                        self.num_input_channels,
                        self.weighted_outputs()?,
                        geometry,
                    )?
                    .with_weight_state(weights),
                )
            }
            EdgeKind::Pooling => {
                if let Some(out) = self.num_output_channels {
                    if out != self.num_input_channels {
                        return Err(configuration(format!(
                            "pooling edge `{}` maps {} channels to {}",
                            self.name, self.num_input_channels, out
                        )));
                    }
                }
                AnyEdge::Pooling(PoolingEdge::new(
                    &self.name,
                    self.num_input_channels,
                    geometry,
                    self.pool_mode,
                )?)
            }
        };
        Ok(edge)
    }

    fn weighted_outputs(&self) -> Result<usize> {
        self.num_output_channels.ok_or_else(|| {
            configuration(format!(
                "weighted edge `{}` needs num_output_channels",
                self.name
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub edges: Vec<EdgeConfig>,
}

impl NetworkConfig {
    pub fn from_json_str(json: &str) -> Result<NetworkConfig> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads the file at `path` and parses it as a network configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<NetworkConfig> {
        let contents = fs::read_to_string(path)?;
        NetworkConfig::from_json_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EdgeError;

    #[test]
    fn defaults_fill_in() {
        let config = NetworkConfig::from_json_str(
            r#"{ "edges": [ { "name": "c", "kind": "conv", "kernel_size": 5,
                               "num_input_channels": 1, "num_output_channels": 2 } ] }"#,
        )
        .unwrap();
        let edge = &config.edges[0];
        assert_eq!(edge.stride, 1);
        assert_eq!(edge.padding, 0);
        assert_eq!(edge.partial_sum, 0);
        assert!(edge.shared_bias);
        assert!(!edge.has_no_bias);
        assert_eq!(edge.scale_gradients, 1.0);
        assert_eq!(edge.pool_mode, PoolMode::Max);
        assert!(edge.tied_to.is_none());
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = NetworkConfig::from_json_str("{ \"edges\": [ { \"name\": 3 } ] }").unwrap_err();
        assert!(matches!(err, EdgeError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = NetworkConfig::load("/nonexistent/edges.json").unwrap_err();
        assert!(matches!(err, EdgeError::Io(_)));
    }

    #[test]
    fn weighted_edges_need_output_channels() {
        let config = EdgeConfig::new("c", EdgeKind::Convolutional, 3, 3);
        assert!(matches!(config.build(), Err(EdgeError::Configuration(_))));
    }

    #[test]
    fn pooling_keeps_channels() {
        let config = EdgeConfig::new("p", EdgeKind::Pooling, 2, 3).stride(2);
        assert_eq!(config.build().unwrap().kind(), EdgeKind::Pooling);
        assert!(config.output_channels(4).build().is_err());
    }

    #[test]
    fn local_edges_reject_partial_sums() {
        let config = EdgeConfig::new("l", EdgeKind::LocallyConnected, 3, 3)
            .output_channels(4)
            .partial_sum(2);
        assert!(config.build().is_err());
    }

    #[test]
    fn zero_stride_rejected() {
        let config = EdgeConfig::new("c", EdgeKind::Convolutional, 3, 3)
            .output_channels(4)
            .stride(0);
        assert!(config.build().is_err());
    }
}
