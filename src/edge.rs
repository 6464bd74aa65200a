//! The contract every edge kind shares: spatial sizing, field of view and
//! tying of geometry.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::ConvShape;
use crate::error::{EdgeError, Result};
use crate::geometry::{FieldOfView, Geometry, Spatial};
use crate::network::EdgeId;

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[serde(alias = "conv")]
    Convolutional,
    #[serde(alias = "local")]
    LocallyConnected,
    #[serde(alias = "pool")]
    Pooling,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeKind::Convolutional => "convolutional",
            EdgeKind::LocallyConnected => "locally connected",
            EdgeKind::Pooling => "pooling",
        };
        f.write_str(name)
    }
}

/// Geometry an edge exposes to edges tied to it.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum TieSource {
    Convolutional {
        geometry: Geometry,
        partial_sum: usize,
        shared_bias: bool,
    },
    LocallyConnected {
        geometry: Geometry,
    },
    Pooling {
        geometry: Geometry,
    },
}

impl TieSource {
    pub fn kind(&self) -> EdgeKind {
        match self {
            TieSource::Convolutional { .. } => EdgeKind::Convolutional,
            TieSource::LocallyConnected { .. } => EdgeKind::LocallyConnected,
            TieSource::Pooling { .. } => EdgeKind::Pooling,
        }
    }
}

/// Sizing state common to all edges.
#[derive(Debug, Clone)]
pub struct EdgeBase {
    name: String,
    num_input_channels: usize,
    num_output_channels: usize,
    geometry: Geometry,
    spatial: Option<Spatial>,
}

impl EdgeBase {
    pub fn new(
        name: &str,
        num_input_channels: usize,
        num_output_channels: usize,
        geometry: Geometry,
    ) -> Result<EdgeBase> {
        if num_input_channels == 0 || num_output_channels == 0 {
            return Err(EdgeError::Configuration(format!(
                "edge `{}` needs at least one input and one output channel",
                name
            )));
        }
        Ok(EdgeBase {
            name: name.to_string(),
            num_input_channels,
            num_output_channels,
            geometry,
            spatial: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_input_channels(&self) -> usize {
        self.num_input_channels
    }

    pub fn num_output_channels(&self) -> usize {
        self.num_output_channels
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Records the input image size and recomputes the output grid.
    pub fn set_image_size(&mut self, image_size_y: usize, image_size_x: usize) -> Result<()> {
        self.spatial = Some(Spatial::resolve(&self.geometry, image_size_y, image_size_x)?);
        Ok(())
    }

    /// Replaces the geometry. An output grid computed from the old one is
    /// recomputed right away so it is never read stale.
    pub fn set_geometry(&mut self, geometry: Geometry) -> Result<()> {
        self.geometry = geometry;
        if let Some(spatial) = self.spatial {
            self.set_image_size(spatial.image_size_y, spatial.image_size_x)?;
        }
        Ok(())
    }

    pub fn spatial(&self) -> Result<Spatial> {
        self.spatial
            .ok_or_else(|| EdgeError::ImageSizeUnset(self.name.clone()))
    }

    pub fn conv_shape(&self) -> Result<ConvShape> {
        Ok(ConvShape::new(
            &self.geometry,
            &self.spatial()?,
            self.num_input_channels,
        ))
    }

    pub fn field_of_view(&self, fov: FieldOfView) -> Result<FieldOfView> {
        let spatial = self.spatial()?;
        Ok(self.geometry.field_of_view(spatial.image_size_x, fov))
    }

    /// `name Label Kernel: k-k-cin : cout Layer: h-w-cin : my-mx-cout`
    pub(crate) fn describe(&self, f: &mut fmt::Formatter<'_>, label: &str) -> fmt::Result {
        let k = self.geometry.kernel_size;
        write!(
            f,
            "{} {} Kernel: {}-{}-{} : {}",
            self.name, label, k, k, self.num_input_channels, self.num_output_channels
        )?;
        match self.spatial {
            Some(s) => write!(
                f,
                " Layer: {}-{}-{} : {}-{}-{}",
                s.image_size_y,
                s.image_size_x,
                self.num_input_channels,
                s.num_modules_y,
                s.num_modules_x,
                self.num_output_channels
            ),
            None => write!(f, " Layer: unsized"),
        }
    }
}

/// Operations every edge supports regardless of kind.
pub trait Edge: fmt::Display {
    fn base(&self) -> &EdgeBase;

    fn base_mut(&mut self) -> &mut EdgeBase;

    fn kind(&self) -> EdgeKind;

    fn name(&self) -> &str {
        self.base().name()
    }

    /// Must be called before any forward or backward pass, and again
    /// whenever the topology changes.
    fn set_image_size(&mut self, image_size_y: usize, image_size_x: usize) -> Result<()> {
        self.base_mut().set_image_size(image_size_y, image_size_x)
    }

    /// Moves a field of view through this edge towards the input.
    fn field_of_view(&self, fov: FieldOfView) -> Result<FieldOfView> {
        self.base().field_of_view(fov)
    }

    /// Geometry descriptor handed to edges that tie to this one.
    fn tie_source(&self) -> TieSource;

    /// Adopts the geometry of `target`. `source` must come from an edge of
    /// the same kind.
    fn set_tied_to(&mut self, target: EdgeId, source: &TieSource) -> Result<()>;

    /// Number of parameter elements this edge owns. Zero for tied and
    /// parameterless edges.
    fn parameter_memory_requirement(&self) -> Result<usize> {
        Ok(0)
    }
}

pub(crate) fn kind_mismatch(edge: &dyn Edge, source: &TieSource) -> EdgeError {
    EdgeError::Configuration(format!(
        "edge `{}` ({}) cannot take the geometry of a {} edge",
        edge.name(),
        edge.kind(),
        source.kind()
    ))
}
