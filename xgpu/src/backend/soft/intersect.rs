//! CPU acceleration structures: built scenes and nearest-hit queries.

use std::sync::Arc;

use crate::accel::{AccelerationStructureInstance, Hit, Ray};

type Vec3 = [f32; 3];

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: Vec3, b: Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Primitive {
    Triangle { vertices: [Vec3; 3] },
    Aabb { min: Vec3, max: Vec3 },
}

/// Geometries of a built bottom-level structure; primitive indices are
/// positions within each geometry.
#[derive(Debug, Default)]
pub(crate) struct BottomLevel {
    pub(crate) geometries: Vec<Vec<Primitive>>,
}

#[derive(Debug)]
pub(crate) struct Instance {
    world_to_object: [f32; 12],
    custom_index: u32,
    mask: u8,
    blas: Arc<BottomLevel>,
}

impl Instance {
    /// `None` when the transform is singular.
    pub(crate) fn new(record: &AccelerationStructureInstance, blas: Arc<BottomLevel>) -> Option<Self> {
        Some(Self {
            world_to_object: invert_affine(&record.transform)?,
            custom_index: record.custom_index(),
            mask: record.mask(),
            blas,
        })
    }
}

#[derive(Debug)]
pub(crate) enum Scene {
    Bottom(Arc<BottomLevel>),
    Top(Vec<Instance>),
}

/// Candidate hit within one bottom-level structure.
struct LocalHit {
    t: f32,
    geometry_index: u32,
    primitive_index: u32,
    barycentrics: [f32; 2],
}

/// Möller–Trumbore. Returns `(t, u, v)` without culling either face.
fn intersect_triangle(origin: Vec3, direction: Vec3, [v0, v1, v2]: [Vec3; 3]) -> Option<(f32, f32, f32)> {
    let e1 = sub(v1, v0);
    let e2 = sub(v2, v0);
    let p = cross(direction, e2);
    let det = dot(e1, p);
    if det.abs() < f32::EPSILON {
        return None;
    }
    let inv = 1.0 / det;
    let s = sub(origin, v0);
    let u = dot(s, p) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = cross(s, e1);
    let v = dot(direction, q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    Some((dot(e2, q) * inv, u, v))
}

/// Slab test. Returns the entry distance, clamped to `t_min` when the origin
/// is inside the box.
fn intersect_aabb(origin: Vec3, direction: Vec3, min: Vec3, max: Vec3, t_min: f32, t_max: f32) -> Option<f32> {
    let mut near = t_min;
    let mut far = t_max;
    for axis in 0..3 {
        if direction[axis] == 0.0 {
            if origin[axis] < min[axis] || origin[axis] > max[axis] {
                return None;
            }
            continue;
        }
        let inv = 1.0 / direction[axis];
        let mut t0 = (min[axis] - origin[axis]) * inv;
        let mut t1 = (max[axis] - origin[axis]) * inv;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        near = near.max(t0);
        far = far.min(t1);
        if near > far {
            return None;
        }
    }
    Some(near)
}

impl BottomLevel {
    fn intersect(&self, origin: Vec3, direction: Vec3, t_min: f32, t_max: f32) -> Option<LocalHit> {
        let mut best: Option<LocalHit> = None;
        for (g, primitives) in self.geometries.iter().enumerate() {
            for (p, primitive) in primitives.iter().enumerate() {
                let limit = best.as_ref().map_or(t_max, |b| b.t);
                let candidate = match *primitive {
                    Primitive::Triangle { vertices } => intersect_triangle(origin, direction, vertices)
                        .filter(|&(t, _, _)| t >= t_min && t < limit)
                        .map(|(t, u, v)| (t, [u, v])),
                    Primitive::Aabb { min, max } => {
                        intersect_aabb(origin, direction, min, max, t_min, limit).map(|t| (t, [0.0, 0.0]))
                    }
                };
                if let Some((t, barycentrics)) = candidate {
                    best = Some(LocalHit {
                        t,
                        geometry_index: g as u32,
                        primitive_index: p as u32,
                        barycentrics,
                    });
                }
            }
        }
        best
    }
}

impl Scene {
    pub(crate) fn intersect(&self, ray: &Ray) -> Option<Hit> {
        match self {
            Scene::Bottom(blas) => blas
                .intersect(ray.origin, ray.direction, ray.t_min, ray.t_max)
                .map(|h| Hit {
                    t: h.t,
                    instance_index: None,
                    instance_custom_index: 0,
                    geometry_index: h.geometry_index,
                    primitive_index: h.primitive_index,
                    barycentrics: h.barycentrics,
                }),
            Scene::Top(instances) => {
                let mut best: Option<Hit> = None;
                for (i, instance) in instances.iter().enumerate() {
                    if instance.mask & ray.mask == 0 {
                        continue;
                    }
                    // A linear map keeps t unchanged between spaces.
                    let origin = transform_point(&instance.world_to_object, ray.origin);
                    let direction = transform_vector(&instance.world_to_object, ray.direction);
                    let limit = best.as_ref().map_or(ray.t_max, |b| b.t);
                    if let Some(h) = instance.blas.intersect(origin, direction, ray.t_min, limit) {
                        best = Some(Hit {
                            t: h.t,
                            instance_index: Some(i as u32),
                            instance_custom_index: instance.custom_index,
                            geometry_index: h.geometry_index,
                            primitive_index: h.primitive_index,
                            barycentrics: h.barycentrics,
                        });
                    }
                }
                best
            }
        }
    }
}

fn transform_point(m: &[f32; 12], p: Vec3) -> Vec3 {
    [
        m[0] * p[0] + m[1] * p[1] + m[2] * p[2] + m[3],
        m[4] * p[0] + m[5] * p[1] + m[6] * p[2] + m[7],
        m[8] * p[0] + m[9] * p[1] + m[10] * p[2] + m[11],
    ]
}

fn transform_vector(m: &[f32; 12], v: Vec3) -> Vec3 {
    [
        m[0] * v[0] + m[1] * v[1] + m[2] * v[2],
        m[4] * v[0] + m[5] * v[1] + m[6] * v[2],
        m[8] * v[0] + m[9] * v[1] + m[10] * v[2],
    ]
}

/// Inverse of a row-major 3x4 affine transform.
fn invert_affine(m: &[f32; 12]) -> Option<[f32; 12]> {
    let (a, b, c) = (m[0], m[1], m[2]);
    let (d, e, f) = (m[4], m[5], m[6]);
    let (g, h, i) = (m[8], m[9], m[10]);
    let det = a * (e * i - f * h) - b * (d * i - f * g) + c * (d * h - e * g);
    if det.abs() < f32::EPSILON {
        return None;
    }
    let inv = 1.0 / det;
    let r = [
        (e * i - f * h) * inv,
        (c * h - b * i) * inv,
        (b * f - c * e) * inv,
        (f * g - d * i) * inv,
        (a * i - c * g) * inv,
        (c * d - a * f) * inv,
        (d * h - e * g) * inv,
        (b * g - a * h) * inv,
        (a * e - b * d) * inv,
    ];
    let t = [m[3], m[7], m[11]];
    Some([
        r[0],
        r[1],
        r[2],
        -(r[0] * t[0] + r[1] * t[1] + r[2] * t[2]),
        r[3],
        r[4],
        r[5],
        -(r[3] * t[0] + r[4] * t[1] + r[5] * t[2]),
        r[6],
        r[7],
        r[8],
        -(r[6] * t[0] + r[7] * t[1] + r[8] * t[2]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::InstanceFlags;

    fn unit_triangle() -> Arc<BottomLevel> {
        Arc::new(BottomLevel {
            geometries: vec![vec![Primitive::Triangle {
                vertices: [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            }]],
        })
    }

    #[test]
    fn moller_trumbore_reports_distance_and_barycentrics() {
        let (t, u, v) = intersect_triangle([0.25, 0.25, 5.0], [0.0, 0.0, -1.0], [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
        ])
        .unwrap();
        assert!((t - 5.0).abs() < 1e-6);
        assert!((u - 0.25).abs() < 1e-6);
        assert!((v - 0.25).abs() < 1e-6);
        let triangle = [[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        assert!(intersect_triangle([0.9, 0.9, 5.0], [0.0, 0.0, -1.0], triangle).is_none());
    }

    #[test]
    fn slab_test_handles_axis_parallel_rays() {
        let hit = intersect_aabb([0.5, 0.5, -3.0], [0.0, 0.0, 1.0], [0.0; 3], [1.0; 3], 0.0, f32::INFINITY);
        assert_eq!(hit, Some(3.0));
        assert!(intersect_aabb([2.0, 0.5, -3.0], [0.0, 0.0, 1.0], [0.0; 3], [1.0; 3], 0.0, f32::INFINITY).is_none());
        let inside = intersect_aabb([0.5; 3], [1.0, 0.0, 0.0], [0.0; 3], [1.0; 3], 0.0, f32::INFINITY);
        assert_eq!(inside, Some(0.0));
    }

    #[test]
    fn inverse_undoes_rotation_and_translation() {
        // 90 degrees about z, then translate.
        let m = [0.0, -1.0, 0.0, 3.0, 1.0, 0.0, 0.0, -2.0, 0.0, 0.0, 1.0, 1.0];
        let inv = invert_affine(&m).unwrap();
        let p = [1.0, 2.0, 3.0];
        let back = transform_point(&inv, transform_point(&m, p));
        for k in 0..3 {
            assert!((back[k] - p[k]).abs() < 1e-5);
        }
        assert!(invert_affine(&[0.0; 12]).is_none());
    }

    #[test]
    fn nearest_instance_wins_and_masks_filter() {
        let mut near = AccelerationStructureInstance::IDENTITY;
        near[11] = 2.0;
        let records = [
            AccelerationStructureInstance::new(
                AccelerationStructureInstance::IDENTITY,
                1,
                0xff,
                0,
                InstanceFlags::empty(),
                0,
            ),
            AccelerationStructureInstance::new(near, 2, 0x0f, 0, InstanceFlags::empty(), 0),
        ];
        let scene = Scene::Top(records.iter().map(|r| Instance::new(r, unit_triangle()).unwrap()).collect());
        let ray = Ray::new([0.2, 0.2, 10.0], [0.0, 0.0, -1.0]);
        let hit = scene.intersect(&ray).unwrap();
        assert_eq!(hit.instance_index, Some(1));
        assert_eq!(hit.instance_custom_index, 2);
        assert!((hit.t - 8.0).abs() < 1e-5);

        let hit = scene.intersect(&Ray { mask: 0xf0, ..ray }).unwrap();
        assert_eq!(hit.instance_index, Some(0));
        assert!((hit.t - 10.0).abs() < 1e-5);
    }
}
