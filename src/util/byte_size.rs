use ash::vk;

/// Size in bytes of a single texel or element.
pub trait ByteSize {
    fn byte_size(&self) -> Option<u64>;
}

impl ByteSize for vk::Format {
    fn byte_size(&self) -> Option<u64> {
        match *self {
            vk::Format::R8_UNORM => Some(1),
            vk::Format::R8G8_UNORM => Some(2),
            vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => Some(4),
            vk::Format::R32G32_SFLOAT => Some(8),
            vk::Format::R32G32B32A32_SFLOAT => Some(16),
            _ => None,
        }
    }
}
