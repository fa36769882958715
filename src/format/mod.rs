//! Pixel format descriptors
//!
//! The storage engine never interprets pixel bytes itself; it only copies
//! them or hands them to the conversion entry points in [`convert`]. A
//! [`PixelFormat`] is the small descriptor that travels alongside pixel
//! data: a color model plus a component type.

pub mod convert;

pub use convert::{convert_pixels, convert_rows};

/// Numeric type of a single pixel component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    U8,
    U16,
    U32,
    F32,
    F64,
}

impl ComponentType {
    /// Size in bytes of one component
    pub fn size(&self) -> usize {
        match self {
            ComponentType::U8 => 1,
            ComponentType::U16 => 2,
            ComponentType::U32 => 4,
            ComponentType::F32 => 4,
            ComponentType::F64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ComponentType::U8 => "u8",
            ComponentType::U16 => "u16",
            ComponentType::U32 => "u32",
            ComponentType::F32 => "float",
            ComponentType::F64 => "double",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "u8" => Some(ComponentType::U8),
            "u16" => Some(ComponentType::U16),
            "u32" => Some(ComponentType::U32),
            "float" => Some(ComponentType::F32),
            "double" => Some(ComponentType::F64),
            _ => None,
        }
    }
}

/// Color model of a pixel
///
/// The `*Premul` models carry color components premultiplied by alpha, with
/// alpha itself stored last. They are the models the samplers interpolate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorModel {
    /// Single luminance channel
    Y,
    /// Luminance + alpha
    Ya,
    /// Premultiplied luminance + alpha
    YaPremul,
    Rgb,
    Rgba,
    /// Premultiplied RGB + alpha
    RgbaPremul,
    Cmyk,
    Cmyka,
    /// Premultiplied CMYK + alpha
    CmykaPremul,
}

impl ColorModel {
    pub fn components(&self) -> usize {
        match self {
            ColorModel::Y => 1,
            ColorModel::Ya | ColorModel::YaPremul => 2,
            ColorModel::Rgb => 3,
            ColorModel::Rgba | ColorModel::RgbaPremul | ColorModel::Cmyk => 4,
            ColorModel::Cmyka | ColorModel::CmykaPremul => 5,
        }
    }

    pub fn has_alpha(&self) -> bool {
        !matches!(self, ColorModel::Y | ColorModel::Rgb | ColorModel::Cmyk)
    }

    pub fn is_cmyk(&self) -> bool {
        matches!(
            self,
            ColorModel::Cmyk | ColorModel::Cmyka | ColorModel::CmykaPremul
        )
    }

    pub fn is_premultiplied(&self) -> bool {
        matches!(
            self,
            ColorModel::YaPremul | ColorModel::RgbaPremul | ColorModel::CmykaPremul
        )
    }

    fn name(&self) -> &'static str {
        match self {
            ColorModel::Y => "Y",
            ColorModel::Ya => "YA",
            ColorModel::YaPremul => "YaA",
            ColorModel::Rgb => "RGB",
            ColorModel::Rgba => "RGBA",
            ColorModel::RgbaPremul => "RaGaBaA",
            ColorModel::Cmyk => "CMYK",
            ColorModel::Cmyka => "CMYKA",
            ColorModel::CmykaPremul => "CaMaYaKaA",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Y" => Some(ColorModel::Y),
            "YA" => Some(ColorModel::Ya),
            "YaA" => Some(ColorModel::YaPremul),
            "RGB" => Some(ColorModel::Rgb),
            "RGBA" => Some(ColorModel::Rgba),
            "RaGaBaA" => Some(ColorModel::RgbaPremul),
            "CMYK" => Some(ColorModel::Cmyk),
            "CMYKA" => Some(ColorModel::Cmyka),
            "CaMaYaKaA" => Some(ColorModel::CmykaPremul),
            _ => None,
        }
    }
}

/// A pixel format: color model + component type
///
/// All components of a pixel share one component type; bytes per pixel is
/// always `components * component_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat {
    pub model: ColorModel,
    pub component: ComponentType,
}

impl PixelFormat {
    pub const RGBA_U8: PixelFormat = PixelFormat::new(ColorModel::Rgba, ComponentType::U8);
    pub const RGBA_U16: PixelFormat = PixelFormat::new(ColorModel::Rgba, ComponentType::U16);
    pub const RGBA_F32: PixelFormat = PixelFormat::new(ColorModel::Rgba, ComponentType::F32);
    pub const RGB_U8: PixelFormat = PixelFormat::new(ColorModel::Rgb, ComponentType::U8);
    pub const Y_U8: PixelFormat = PixelFormat::new(ColorModel::Y, ComponentType::U8);
    pub const Y_F32: PixelFormat = PixelFormat::new(ColorModel::Y, ComponentType::F32);
    pub const RGBA_PREMUL_F32: PixelFormat =
        PixelFormat::new(ColorModel::RgbaPremul, ComponentType::F32);
    pub const YA_PREMUL_F32: PixelFormat =
        PixelFormat::new(ColorModel::YaPremul, ComponentType::F32);
    pub const CMYKA_PREMUL_F32: PixelFormat =
        PixelFormat::new(ColorModel::CmykaPremul, ComponentType::F32);

    pub const fn new(model: ColorModel, component: ComponentType) -> Self {
        Self { model, component }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.model.components() * self.component.size()
    }

    pub fn components(&self) -> usize {
        self.model.components()
    }

    pub fn has_alpha(&self) -> bool {
        self.model.has_alpha()
    }

    /// Format name as stored in buffer file headers, e.g. `"RGBA u8"`
    pub fn name(&self) -> String {
        format!("{} {}", self.model.name(), self.component.name())
    }

    /// Parses a name produced by [`PixelFormat::name`]
    pub fn from_name(name: &str) -> Option<Self> {
        let mut parts = name.split_whitespace();
        let model = ColorModel::from_name(parts.next()?)?;
        let component = ComponentType::from_name(parts.next()?)?;
        Some(Self { model, component })
    }

    /// The float format the samplers interpolate in for this color model
    pub fn interpolation_format(&self) -> PixelFormat {
        if self.model.is_cmyk() {
            PixelFormat::CMYKA_PREMUL_F32
        } else {
            match self.model {
                ColorModel::Y | ColorModel::Ya | ColorModel::YaPremul => {
                    PixelFormat::YA_PREMUL_F32
                }
                _ => PixelFormat::RGBA_PREMUL_F32,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_sizes() {
        assert_eq!(ComponentType::U8.size(), 1);
        assert_eq!(ComponentType::U16.size(), 2);
        assert_eq!(ComponentType::F32.size(), 4);
        assert_eq!(ComponentType::F64.size(), 8);
    }

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(PixelFormat::RGBA_U8.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::RGBA_F32.bytes_per_pixel(), 16);
        assert_eq!(PixelFormat::Y_U8.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::CMYKA_PREMUL_F32.bytes_per_pixel(), 20);
    }

    #[test]
    fn test_name_round_trip() {
        for fmt in [
            PixelFormat::RGBA_U8,
            PixelFormat::RGB_U8,
            PixelFormat::Y_F32,
            PixelFormat::RGBA_PREMUL_F32,
            PixelFormat::new(ColorModel::Cmyka, ComponentType::U16),
        ] {
            assert_eq!(PixelFormat::from_name(&fmt.name()), Some(fmt));
        }
        assert_eq!(PixelFormat::from_name("bogus"), None);
    }

    #[test]
    fn test_interpolation_format() {
        assert_eq!(
            PixelFormat::RGBA_U8.interpolation_format(),
            PixelFormat::RGBA_PREMUL_F32
        );
        assert_eq!(
            PixelFormat::Y_U8.interpolation_format(),
            PixelFormat::YA_PREMUL_F32
        );
        assert_eq!(
            PixelFormat::new(ColorModel::Cmyk, ComponentType::U8).interpolation_format(),
            PixelFormat::CMYKA_PREMUL_F32
        );
    }

    #[test]
    fn test_alpha_flag() {
        assert!(PixelFormat::RGBA_U8.has_alpha());
        assert!(!PixelFormat::RGB_U8.has_alpha());
        assert!(!PixelFormat::Y_U8.has_alpha());
    }
}
