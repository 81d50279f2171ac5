//! Brick catalog: partitions a volume level into bricks and orders them per view

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::core::types::{UVec3, Vec3};
use crate::math::{Aabb, Ray};
use super::brick::{Brick, BrickId};
use super::descriptor::{VolumeData, VolumeDescriptor, VolumeId};

/// Compositing order of sorted bricks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateOrder {
    /// Nearest brick first, blended with the "under" operator
    #[default]
    FrontToBack,
    /// Farthest brick first, blended with the "over" operator
    BackToFront,
}

/// Parameters that decide brick dimensions at build time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickLayout {
    /// Largest brick edge in voxels
    pub max_brick_size: u32,
    /// Hardware ceiling for 3D texture edges
    pub max_texture_size: u32,
    /// Round brick edges down to powers of two for non-pow2 incapable devices
    pub force_pow2: bool,
}

impl Default for BrickLayout {
    fn default() -> Self {
        Self {
            max_brick_size: 256,
            max_texture_size: 2048,
            force_pow2: false,
        }
    }
}

impl BrickLayout {
    /// Brick edge along one axis of `dim` voxels
    pub fn brick_edge(&self, dim: u32) -> u32 {
        let limit = self.max_brick_size.min(self.max_texture_size).max(2);
        let pow = dim.max(1).next_power_of_two();
        let edge = if self.force_pow2 && pow > dim {
            (pow / 2).min(limit)
        } else {
            pow.min(limit)
        };
        edge.max(2)
    }
}

/// Number of one-voxel-overlapping bricks of edge `bsize` covering `size` voxels
pub fn brick_count_1d(size: u32, bsize: u32) -> u32 {
    if size <= 1 || bsize <= 1 {
        return 1;
    }
    let span = size - 1;
    let step = bsize - 1;
    span.div_ceil(step)
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct SortKey {
    origin: [u32; 3],
    direction: [u32; 3],
    orthographic: bool,
    order: UpdateOrder,
}

impl SortKey {
    fn new(view: &Ray, orthographic: bool, order: UpdateOrder) -> Self {
        Self {
            origin: view.origin.to_array().map(f32::to_bits),
            direction: view.direction.to_array().map(f32::to_bits),
            orthographic,
            order,
        }
    }
}

/// Bricks of one volume at one resolution level
#[derive(Clone, Debug)]
pub struct BrickCatalog {
    volume: VolumeId,
    level: u32,
    desc: VolumeDescriptor,
    /// Brick edge per axis
    brick_size: UVec3,
    /// Brick count per axis
    grid: UVec3,
    bricks: Vec<Brick>,
    sorted: Vec<BrickId>,
    sort_key: Option<SortKey>,
    sort_dirty: bool,
    selection: Vec<BrickId>,
}

impl BrickCatalog {
    /// Split a volume level into bricks no larger than the layout allows
    ///
    /// Degenerate volumes produce an empty catalog.
    pub fn build(volume: VolumeId, level: u32, desc: &VolumeDescriptor, layout: &BrickLayout) -> Self {
        if desc.is_degenerate() {
            log::warn!("Volume {:?} level {} is degenerate ({:?}); catalog is empty", volume, level, desc.dims);
            return Self::from_bricks(volume, level, *desc, Vec::new());
        }

        let dims = desc.dims;
        let bsize = UVec3::new(
            layout.brick_edge(dims.x),
            layout.brick_edge(dims.y),
            layout.brick_edge(dims.z),
        );
        let grid = UVec3::new(
            brick_count_1d(dims.x, bsize.x),
            brick_count_1d(dims.y, bsize.y),
            brick_count_1d(dims.z, bsize.z),
        );
        let bounds = desc.world_bounds();
        let dims_f = dims.as_vec3();

        let mut bricks = Vec::with_capacity((grid.x * grid.y * grid.z) as usize);
        for k in 0..grid.z {
            for j in 0..grid.y {
                for i in 0..grid.x {
                    let start = UVec3::new(i, j, k) * (bsize - UVec3::ONE);
                    let start = start.min(dims - UVec3::ONE);
                    let size = bsize.min(dims - start);
                    let end = start + size;

                    let mut t0 = Vec3::splat(0.5) / size.as_vec3();
                    let mut t1 = Vec3::ONE - t0;
                    let mut b0 = (start.as_vec3() + Vec3::splat(0.5)) / dims_f;
                    let mut b1 = (end.as_vec3() - Vec3::splat(0.5)) / dims_f;
                    for axis in 0..3 {
                        if start[axis] == 0 {
                            t0[axis] = 0.0;
                            b0[axis] = 0.0;
                        }
                        if end[axis] == dims[axis] {
                            t1[axis] = 1.0;
                            b1[axis] = 1.0;
                        }
                    }
                    let d0 = start.as_vec3() / dims_f;
                    let d1 = end.as_vec3() / dims_f;

                    let id = BrickId(bricks.len() as u32);
                    bricks.push(Brick::new(
                        id,
                        start,
                        size,
                        Aabb::new(t0, t1),
                        Aabb::new(bounds.lerp(b0), bounds.lerp(b1)),
                        Aabb::new(bounds.lerp(d0), bounds.lerp(d1)),
                    ));
                }
            }
        }

        log::info!(
            "Built {} bricks ({}x{}x{}) of {:?} voxels for volume {:?} level {}",
            bricks.len(), grid.x, grid.y, grid.z, bsize, volume, level
        );

        let mut catalog = Self::from_bricks(volume, level, *desc, bricks);
        catalog.brick_size = bsize;
        catalog.grid = grid;
        catalog
    }

    /// Wrap a brick list produced elsewhere (e.g. a pyramid descriptor)
    ///
    /// Brick ids are reassigned to their position in `bricks`.
    pub fn from_bricks(volume: VolumeId, level: u32, desc: VolumeDescriptor, bricks: Vec<Brick>) -> Self {
        let bricks: Vec<Brick> = bricks
            .into_iter()
            .enumerate()
            .map(|(i, b)| {
                Brick::new(BrickId(i as u32), b.offset(), b.size(), *b.tbox(), *b.bbox(), *b.dbox())
            })
            .collect();
        let brick_size = bricks.iter().fold(UVec3::ZERO, |acc, b| acc.max(b.size()));
        Self {
            volume,
            level,
            desc,
            brick_size,
            grid: UVec3::ZERO,
            bricks,
            sorted: Vec::new(),
            sort_key: None,
            sort_dirty: true,
            selection: Vec::new(),
        }
    }

    pub fn volume(&self) -> VolumeId {
        self.volume
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.desc
    }

    pub fn brick_size(&self) -> UVec3 {
        self.brick_size
    }

    /// Brick counts per axis (zero for catalogs not built on a grid)
    pub fn grid(&self) -> UVec3 {
        self.grid
    }

    pub fn len(&self) -> usize {
        self.bricks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bricks.is_empty()
    }

    /// All bricks in id order
    pub fn bricks(&self) -> &[Brick] {
        &self.bricks
    }

    pub fn get(&self, id: BrickId) -> Option<&Brick> {
        self.bricks.get(id.index())
    }

    /// Force the next sort to recompute distances
    pub fn mark_sort_dirty(&mut self) {
        self.sort_dirty = true;
    }

    pub fn is_sort_dirty(&self) -> bool {
        self.sort_dirty
    }

    /// Mark all-zero bricks with priority 1 so they are never uploaded
    pub fn assign_priorities(&mut self, data: &VolumeData) {
        let mut empty = 0;
        for brick in &mut self.bricks {
            let skip = data.is_block_empty(brick.offset(), brick.size());
            brick.set_priority(u8::from(skip));
            empty += usize::from(skip);
        }
        log::debug!("Volume {:?}: {} of {} bricks are empty", self.volume, empty, self.bricks.len());
    }

    /// Clear all skip priorities
    pub fn reset_priorities(&mut self) {
        self.bricks.iter_mut().for_each(|b| b.set_priority(0));
    }

    /// Bricks ordered by view distance
    ///
    /// The order is cached and only recomputed when the view, projection or
    /// order changed or [`mark_sort_dirty`](Self::mark_sort_dirty) was called.
    pub fn sorted_bricks(&mut self, view: &Ray, orthographic: bool, order: UpdateOrder) -> &[BrickId] {
        let key = SortKey::new(view, orthographic, order);
        if self.sort_dirty || self.sort_key != Some(key) {
            for brick in &mut self.bricks {
                let d = view_distance(brick.bbox(), view, orthographic);
                brick.set_distance(d);
            }
            let mut ids: Vec<BrickId> = self.bricks.iter().map(Brick::id).collect();
            sort_by_distance(&mut ids, &self.bricks, order);
            self.sorted = ids;
            self.sort_key = Some(key);
            self.sort_dirty = false;
        }
        &self.sorted
    }

    /// At most `quota` visible bricks nearest to `center`, ordered by view distance
    ///
    /// Candidates are ranked by distance from their center to `center` with ties
    /// broken by id, so growing the quota only ever appends bricks.
    pub fn closest_bricks(
        &mut self,
        center: Vec3,
        quota: usize,
        skip_empty: bool,
        view: &Ray,
        orthographic: bool,
        order: UpdateOrder,
        visible: impl Fn(&Brick) -> bool,
    ) -> &[BrickId] {
        self.selection.clear();
        if quota == 0 || self.bricks.is_empty() {
            return &self.selection;
        }

        let mut ranked: Vec<(f32, BrickId)> = self
            .bricks
            .iter()
            .map(|b| (b.bbox().center().distance(center), b.id()))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        for (_, id) in ranked {
            if self.selection.len() >= quota {
                break;
            }
            let brick = &self.bricks[id.index()];
            if skip_empty && brick.priority() > 0 {
                continue;
            }
            if visible(brick) {
                self.selection.push(id);
            }
        }

        for &id in &self.selection {
            let brick = &mut self.bricks[id.index()];
            let d = view_distance(brick.bbox(), view, orthographic);
            brick.set_distance(d);
        }
        let mut selection = std::mem::take(&mut self.selection);
        sort_by_distance(&mut selection, &self.bricks, order);
        self.selection = selection;
        &self.selection
    }
}

/// Distance of a brick to the viewer used for ordering
///
/// Corners are pulled in by diag/1000 so bricks sharing a face do not tie.
pub fn view_distance(bbox: &Aabb, view: &Ray, orthographic: bool) -> f32 {
    let shrunk = bbox.inset(bbox.diagonal() / 1000.0);
    shrunk
        .corners()
        .iter()
        .map(|&c| {
            if orthographic {
                view.depth_of(c)
            } else {
                c.distance(view.origin)
            }
        })
        .fold(f32::INFINITY, f32::min)
}

fn sort_by_distance(ids: &mut [BrickId], bricks: &[Brick], order: UpdateOrder) {
    ids.sort_by(|a, b| {
        let da = bricks[a.index()].distance();
        let db = bricks[b.index()].distance();
        let by_distance = match order {
            UpdateOrder::FrontToBack => da.total_cmp(&db),
            UpdateOrder::BackToFront => db.total_cmp(&da),
        };
        match by_distance {
            Ordering::Equal => a.cmp(b),
            other => other,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::descriptor::BitDepth;

    fn catalog(dims: UVec3, brick: u32) -> BrickCatalog {
        let desc = VolumeDescriptor::new(dims, Vec3::ONE, BitDepth::U8);
        let layout = BrickLayout { max_brick_size: brick, ..Default::default() };
        BrickCatalog::build(VolumeId(0), 0, &desc, &layout)
    }

    #[test]
    fn test_brick_count_1d() {
        assert_eq!(brick_count_1d(64, 64), 1);
        assert_eq!(brick_count_1d(65, 64), 2);
        assert_eq!(brick_count_1d(66, 64), 2);
        assert_eq!(brick_count_1d(1, 64), 1);
        assert_eq!(brick_count_1d(127, 64), 2);
        assert_eq!(brick_count_1d(128, 64), 3);
    }

    #[test]
    fn test_brick_edge_respects_limits() {
        let layout = BrickLayout { max_brick_size: 128, max_texture_size: 64, force_pow2: false };
        assert_eq!(layout.brick_edge(100), 64);
        assert_eq!(layout.brick_edge(20), 32);
        let pow2 = BrickLayout { max_brick_size: 512, max_texture_size: 512, force_pow2: true };
        assert_eq!(pow2.brick_edge(100), 64);
        assert_eq!(pow2.brick_edge(128), 128);
    }

    #[test]
    fn test_build_overlaps_by_one_voxel() {
        let cat = catalog(UVec3::new(15, 8, 8), 8);
        assert_eq!(cat.grid(), UVec3::new(2, 1, 1));
        assert_eq!(cat.len(), 2);
        let a = &cat.bricks()[0];
        let b = &cat.bricks()[1];
        assert_eq!(a.offset(), UVec3::ZERO);
        assert_eq!(b.offset(), UVec3::new(7, 0, 0));
        assert_eq!(b.size(), UVec3::new(8, 8, 8));
        // Sampling regions abut exactly at the shared voxel's center.
        assert_eq!(a.bbox().max.x, b.bbox().min.x);
        assert_eq!(a.bbox().min, Vec3::ZERO);
        assert_eq!(b.bbox().max, Vec3::new(15.0, 8.0, 8.0));
        assert_eq!(a.tbox().min.x, 0.0);
        assert_eq!(b.tbox().max.x, 1.0);
        assert!((b.tbox().min.x - 0.5 / 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_volume_has_no_bricks() {
        let mut cat = catalog(UVec3::new(0, 8, 8), 8);
        assert!(cat.is_empty());
        let ray = Ray::new(Vec3::Z * 10.0, -Vec3::Z);
        assert!(cat.sorted_bricks(&ray, false, UpdateOrder::FrontToBack).is_empty());
        assert!(cat
            .closest_bricks(Vec3::ZERO, 4, false, &ray, false, UpdateOrder::FrontToBack, |_| true)
            .is_empty());
    }

    #[test]
    fn test_sorted_front_to_back_and_back_to_front() {
        let mut cat = catalog(UVec3::new(8, 8, 22), 8);
        assert_eq!(cat.len(), 3);
        let ray = Ray::new(Vec3::new(4.0, 4.0, 50.0), -Vec3::Z);
        let front: Vec<_> = cat.sorted_bricks(&ray, true, UpdateOrder::FrontToBack).to_vec();
        assert_eq!(front, vec![BrickId(2), BrickId(1), BrickId(0)]);
        let back: Vec<_> = cat.sorted_bricks(&ray, false, UpdateOrder::BackToFront).to_vec();
        assert_eq!(back, vec![BrickId(0), BrickId(1), BrickId(2)]);
    }

    #[test]
    fn test_sort_is_idempotent_and_cached() {
        let mut cat = catalog(UVec3::new(30, 30, 30), 8);
        let ray = Ray::new(Vec3::new(-20.0, 13.0, 40.0), Vec3::new(0.5, 0.0, -1.0).normalize());
        let first = cat.sorted_bricks(&ray, false, UpdateOrder::FrontToBack).to_vec();
        assert!(!cat.is_sort_dirty());
        let second = cat.sorted_bricks(&ray, false, UpdateOrder::FrontToBack).to_vec();
        assert_eq!(first, second);

        let moved = Ray::new(Vec3::new(40.0, 13.0, -20.0), Vec3::new(-1.0, 0.0, 0.5).normalize());
        let third = cat.sorted_bricks(&moved, false, UpdateOrder::FrontToBack).to_vec();
        assert_ne!(first, third);
        assert_eq!(third.len(), first.len());
    }

    #[test]
    fn test_ties_broken_by_id() {
        // Two bricks side by side, equidistant from an eye on the symmetry plane.
        let mut cat = catalog(UVec3::new(15, 8, 8), 8);
        let ray = Ray::new(Vec3::new(7.5, 4.0, 30.0), -Vec3::Z);
        let ids = cat.sorted_bricks(&ray, true, UpdateOrder::FrontToBack).to_vec();
        assert_eq!(ids, vec![BrickId(0), BrickId(1)]);
        let ids = cat.sorted_bricks(&ray, true, UpdateOrder::BackToFront).to_vec();
        assert_eq!(ids, vec![BrickId(0), BrickId(1)]);
    }

    #[test]
    fn test_closest_bricks_quota_growth_is_monotonic() {
        let mut cat = catalog(UVec3::new(29, 29, 8), 8);
        assert_eq!(cat.len(), 16);
        let ray = Ray::new(Vec3::new(14.0, 14.0, 40.0), -Vec3::Z);
        let center = Vec3::new(0.0, 0.0, 4.0);
        let mut previous: Vec<BrickId> = Vec::new();
        for quota in 1..=cat.len() {
            let mut picked = cat
                .closest_bricks(center, quota, false, &ray, true, UpdateOrder::FrontToBack, |_| true)
                .to_vec();
            assert_eq!(picked.len(), quota);
            picked.sort();
            assert!(previous.iter().all(|id| picked.contains(id)));
            previous = picked;
        }
        assert!(previous.contains(&BrickId(0)));
    }

    #[test]
    fn test_closest_bricks_skips_empty_and_invisible() {
        let desc = VolumeDescriptor::new(UVec3::new(22, 8, 8), Vec3::ONE, BitDepth::U8);
        let layout = BrickLayout { max_brick_size: 8, ..Default::default() };
        let mut cat = BrickCatalog::build(VolumeId(1), 0, &desc, &layout);
        let data = VolumeData::from_fn(desc, |p| if p.x >= 16 { 5 } else { 0 }).unwrap();
        cat.assign_priorities(&data);
        assert_eq!(cat.bricks().iter().filter(|b| b.priority() > 0).count(), 2);

        let ray = Ray::new(Vec3::new(11.0, 4.0, 40.0), -Vec3::Z);
        let picked = cat
            .closest_bricks(Vec3::ZERO, 3, true, &ray, true, UpdateOrder::FrontToBack, |_| true)
            .to_vec();
        assert_eq!(picked, vec![BrickId(2)]);
        let none = cat
            .closest_bricks(Vec3::ZERO, 3, false, &ray, true, UpdateOrder::FrontToBack, |b| b.id() != BrickId(0))
            .to_vec();
        assert_eq!(none.len(), 2);
        assert!(!none.contains(&BrickId(0)));
    }
}
