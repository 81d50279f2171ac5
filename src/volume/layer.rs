//! Scene layers drawn by a canvas

use std::sync::Arc;

use crate::core::types::Vec3;
use crate::math::Aabb;
use crate::render::mesh::MeshSource;
use super::volume::Volume;

/// Mesh drawn by a collaborator
#[derive(Clone)]
pub struct MeshLayer {
    pub mesh: Arc<dyn MeshSource>,
    pub display: bool,
}

/// Labelled points in world space
#[derive(Clone, Debug)]
pub struct AnnotationLayer {
    pub name: String,
    pub points: Vec<(Vec3, String)>,
    pub color: Vec3,
    pub display: bool,
}

/// Named list of child layers sharing a display toggle
pub struct LayerGroup {
    pub name: String,
    pub display: bool,
    pub children: Vec<Layer>,
}

impl LayerGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), display: true, children: Vec::new() }
    }

    pub fn with(mut self, layer: Layer) -> Self {
        self.children.push(layer);
        self
    }
}

/// Layer kind tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Volume,
    Mesh,
    Annotation,
    VolumeGroup,
    MeshGroup,
}

pub enum Layer {
    Volume(Box<Volume>),
    Mesh(MeshLayer),
    Annotation(AnnotationLayer),
    VolumeGroup(LayerGroup),
    MeshGroup(LayerGroup),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Volume(_) => LayerKind::Volume,
            Layer::Mesh(_) => LayerKind::Mesh,
            Layer::Annotation(_) => LayerKind::Annotation,
            Layer::VolumeGroup(_) => LayerKind::VolumeGroup,
            Layer::MeshGroup(_) => LayerKind::MeshGroup,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Layer::Volume(v) => v.name(),
            Layer::Mesh(m) => m.mesh.name(),
            Layer::Annotation(a) => &a.name,
            Layer::VolumeGroup(g) | Layer::MeshGroup(g) => &g.name,
        }
    }

    /// World bounds; groups report the union of their children
    pub fn bounds(&self) -> Option<Aabb> {
        match self {
            Layer::Volume(v) => Some(v.bounds()),
            Layer::Mesh(m) => Some(m.mesh.bounds()),
            Layer::Annotation(a) => {
                let mut it = a.points.iter().map(|(p, _)| *p);
                let first = it.next()?;
                let mut bounds = Aabb::new(first, first);
                it.for_each(|p| bounds.expand(p));
                Some(bounds)
            }
            Layer::VolumeGroup(g) | Layer::MeshGroup(g) => g
                .children
                .iter()
                .filter_map(Layer::bounds)
                .reduce(|a, b| a.merged(&b)),
        }
    }

    pub fn is_displayed(&self) -> bool {
        match self {
            Layer::Volume(v) => v.display,
            Layer::Mesh(m) => m.display,
            Layer::Annotation(a) => a.display,
            Layer::VolumeGroup(g) | Layer::MeshGroup(g) => g.display,
        }
    }

    /// Toggle display; groups apply the toggle to all children
    pub fn set_display(&mut self, display: bool) {
        match self {
            Layer::Volume(v) => v.display = display,
            Layer::Mesh(m) => m.display = display,
            Layer::Annotation(a) => a.display = display,
            Layer::VolumeGroup(g) | Layer::MeshGroup(g) => {
                g.display = display;
                g.children.iter_mut().for_each(|c| c.set_display(display));
            }
        }
    }

    pub fn children(&self) -> &[Layer] {
        match self {
            Layer::VolumeGroup(g) | Layer::MeshGroup(g) => &g.children,
            _ => &[],
        }
    }

    /// Displayed volumes in layer order
    pub fn collect_volumes<'a>(&'a self, out: &mut Vec<&'a Volume>) {
        if !self.is_displayed() {
            return;
        }
        match self {
            Layer::Volume(v) => out.push(v.as_ref()),
            Layer::VolumeGroup(g) => g.children.iter().for_each(|c| c.collect_volumes(out)),
            _ => {}
        }
    }

    pub fn collect_volumes_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Volume>) {
        if !self.is_displayed() {
            return;
        }
        match self {
            Layer::Volume(v) => out.push(v.as_mut()),
            Layer::VolumeGroup(g) => g.children.iter_mut().for_each(|c| c.collect_volumes_mut(out)),
            _ => {}
        }
    }

    /// Displayed meshes in layer order
    pub fn collect_meshes(&self, out: &mut Vec<Arc<dyn MeshSource>>) {
        if !self.is_displayed() {
            return;
        }
        match self {
            Layer::Mesh(m) => out.push(m.mesh.clone()),
            Layer::MeshGroup(g) => g.children.iter().for_each(|c| c.collect_meshes(out)),
            _ => {}
        }
    }

    /// Every volume regardless of display state
    pub fn visit_all_volumes_mut(&mut self, f: &mut dyn FnMut(&mut Volume)) {
        match self {
            Layer::Volume(v) => f(v.as_mut()),
            Layer::VolumeGroup(g) => g.children.iter_mut().for_each(|c| c.visit_all_volumes_mut(f)),
            _ => {}
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("display", &self.is_displayed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::UVec3;
    use crate::render::mesh::BoxMesh;
    use crate::volume::{BitDepth, BrickLayout, VolumeData, VolumeDescriptor, VolumeId};

    fn volume(id: u32, origin: Vec3) -> Layer {
        let desc = VolumeDescriptor::new(UVec3::splat(4), Vec3::ONE, BitDepth::U8).with_origin(origin);
        let data = Arc::new(VolumeData::from_fn(desc, |_| 1).unwrap());
        Layer::Volume(Box::new(Volume::from_data(VolumeId(id), format!("v{}", id), data, &BrickLayout::default(), false)))
    }

    #[test]
    fn test_group_bounds_are_union() {
        let group = Layer::VolumeGroup(
            LayerGroup::new("g")
                .with(volume(1, Vec3::ZERO))
                .with(volume(2, Vec3::new(10.0, 0.0, 0.0))),
        );
        let b = group.bounds().unwrap();
        assert_eq!(b.min, Vec3::ZERO);
        assert_eq!(b.max, Vec3::new(14.0, 4.0, 4.0));
        assert_eq!(Layer::VolumeGroup(LayerGroup::new("empty")).bounds(), None);
    }

    #[test]
    fn test_hidden_group_hides_children() {
        let mut group = Layer::VolumeGroup(LayerGroup::new("g").with(volume(1, Vec3::ZERO)).with(volume(2, Vec3::ZERO)));
        let mut out = Vec::new();
        group.collect_volumes(&mut out);
        assert_eq!(out.len(), 2);

        group.set_display(false);
        let mut out = Vec::new();
        group.collect_volumes(&mut out);
        assert!(out.is_empty());
        assert!(group.children().iter().all(|c| !c.is_displayed()));
    }

    #[test]
    fn test_mesh_and_annotation_layers() {
        let mesh = Layer::MeshGroup(LayerGroup::new("meshes").with(Layer::Mesh(MeshLayer {
            mesh: Arc::new(BoxMesh::new("b", Aabb::new(Vec3::ZERO, Vec3::ONE), Vec3::ONE)),
            display: true,
        })));
        let mut meshes = Vec::new();
        mesh.collect_meshes(&mut meshes);
        assert_eq!(meshes.len(), 1);
        assert_eq!(mesh.kind(), LayerKind::MeshGroup);

        let notes = Layer::Annotation(AnnotationLayer {
            name: "n".into(),
            points: vec![(Vec3::ZERO, "a".into()), (Vec3::new(2.0, 1.0, 0.0), "b".into())],
            color: Vec3::ONE,
            display: true,
        });
        assert_eq!(notes.bounds().unwrap().max, Vec3::new(2.0, 1.0, 0.0));
    }
}
