use ash::vk;
use glam::Affine3A;

pub trait AsVkHandle {
    type Handle: ash::vk::Handle + Copy;
    fn vk_handle(&self) -> Self::Handle;
}
impl<T> AsVkHandle for &'_ T
where
    T: AsVkHandle,
{
    type Handle = T::Handle;

    fn vk_handle(&self) -> Self::Handle {
        T::vk_handle(self)
    }
}
impl<T> AsVkHandle for &'_ mut T
where
    T: AsVkHandle,
{
    type Handle = T::Handle;

    fn vk_handle(&self) -> Self::Handle {
        T::vk_handle(self)
    }
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Converts an object to world transform into the matrix layout used by
/// acceleration structure instances.
pub fn glam_to_vk_transform(affine: Affine3A) -> vk::TransformMatrixKHR {
    vk::TransformMatrixKHR {
        matrix: glam_to_row_major(affine),
    }
}

/// Row-major 3x4 matrix.
fn glam_to_row_major(affine: Affine3A) -> [f32; 12] {
    let x = &affine.matrix3.x_axis;
    let y = &affine.matrix3.y_axis;
    let z = &affine.matrix3.z_axis;
    let w = &affine.translation;
    [x.x, y.x, z.x, w.x, x.y, y.y, z.y, w.y, x.z, y.z, z.z, w.z]
}
