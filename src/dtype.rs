use std::{
    fmt::{Debug, Display},
    io::{self, Read, Write},
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntSize {
    b8,
    b16,
    b32,
    b64,
}

impl IntSize {
    pub fn nbytes(&self) -> usize {
        match self {
            Self::b8 => 1,
            Self::b16 => 2,
            Self::b32 => 4,
            Self::b64 => 8,
        }
    }
}

impl TryFrom<usize> for IntSize {
    type Error = &'static str;

    fn try_from(nbits: usize) -> Result<Self, Self::Error> {
        match nbits {
            8 => Ok(Self::b8),
            16 => Ok(Self::b16),
            32 => Ok(Self::b32),
            64 => Ok(Self::b64),
            _ => Err("Not a valid integer width"),
        }
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatSize {
    b32,
    b64,
}

impl FloatSize {
    pub fn nbytes(&self) -> usize {
        match self {
            Self::b32 => 4,
            Self::b64 => 8,
        }
    }
}

impl TryFrom<usize> for FloatSize {
    type Error = &'static str;

    fn try_from(nbits: usize) -> Result<Self, Self::Error> {
        match nbits {
            32 => Ok(Self::b32),
            64 => Ok(Self::b64),
            _ => Err("Not a valid float width"),
        }
    }
}

/// Element type of a tensor, fixed for the tensor's lifetime
/// once the first sample is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Int(IntSize),
    UInt(IntSize),
    Float(FloatSize),
}

impl DataType {
    /// Number of bytes in one element.
    pub fn nbytes(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Int(s) | Self::UInt(s) => s.nbytes(),
            Self::Float(s) => s.nbytes(),
        }
    }

    pub fn nbits(&self) -> usize {
        self.nbytes() * 8
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nbits = self.nbits();
        let s = match self {
            Self::Bool => "bool".into(),
            Self::Int(_) => format!("int{nbits}"),
            Self::UInt(_) => format!("uint{nbits}"),
            Self::Float(_) => format!("float{nbits}"),
        };
        write!(f, "{}", s)
    }
}

fn split_str_num(s: &str) -> (&str, Option<usize>) {
    let clos = |c: char| c.is_ascii_digit();
    if let Some(idx) = s.find(clos) {
        match s[idx..].parse() {
            Ok(n) => (&s[0..idx], Some(n)),
            Err(_) => (s, None),
        }
    } else {
        (s, None)
    }
}

impl FromStr for DataType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, nbits) = split_str_num(s);
        if let Some(n) = nbits {
            match name {
                "int" => Ok(Self::Int(n.try_into()?)),
                "uint" => Ok(Self::UInt(n.try_into()?)),
                "float" => Ok(Self::Float(n.try_into()?)),
                _ => Err("Unknown data type"),
            }
        } else if s == "bool" {
            Ok(Self::Bool)
        } else {
            Err("Could not parse data type")
        }
    }
}

impl Serialize for DataType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

/// Trait implemented by Rust primitives that can be stored as tensor elements.
///
/// Elements are written little-endian regardless of host byte order,
/// matching the on-disk chunk layout.
pub trait ReflectedType:
    Send + Sync + Clone + Copy + Default + PartialEq + Debug + 'static
{
    const DTYPE: DataType;

    /// Write one element's bytes.
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()>;

    /// Read one element's bytes.
    fn read_from<R: Read>(r: &mut R) -> io::Result<Self>;
}

macro_rules! reflected_primitive {
    ($d_name:expr, $d_type:ty, $bo_read_fn:ident, $bo_write_fn:ident) => {
        impl ReflectedType for $d_type {
            const DTYPE: DataType = $d_name;

            fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
                use byteorder::{LittleEndian, WriteBytesExt};
                w.$bo_write_fn::<LittleEndian>(*self)
            }

            fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
                use byteorder::{LittleEndian, ReadBytesExt};
                r.$bo_read_fn::<LittleEndian>()
            }
        }
    };
}

impl ReflectedType for bool {
    const DTYPE: DataType = DataType::Bool;

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        use byteorder::WriteBytesExt;
        w.write_u8(u8::from(*self))
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        use byteorder::ReadBytesExt;
        Ok(r.read_u8()? != 0)
    }
}

impl ReflectedType for u8 {
    const DTYPE: DataType = DataType::UInt(IntSize::b8);

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        use byteorder::WriteBytesExt;
        w.write_u8(*self)
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        use byteorder::ReadBytesExt;
        r.read_u8()
    }
}

impl ReflectedType for i8 {
    const DTYPE: DataType = DataType::Int(IntSize::b8);

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        use byteorder::WriteBytesExt;
        w.write_i8(*self)
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        use byteorder::ReadBytesExt;
        r.read_i8()
    }
}

reflected_primitive!(DataType::UInt(IntSize::b16), u16, read_u16, write_u16);
reflected_primitive!(DataType::UInt(IntSize::b32), u32, read_u32, write_u32);
reflected_primitive!(DataType::UInt(IntSize::b64), u64, read_u64, write_u64);
reflected_primitive!(DataType::Int(IntSize::b16), i16, read_i16, write_i16);
reflected_primitive!(DataType::Int(IntSize::b32), i32, read_i32, write_i32);
reflected_primitive!(DataType::Int(IntSize::b64), i64, read_i64, write_i64);
reflected_primitive!(DataType::Float(FloatSize::b32), f32, read_f32, write_f32);
reflected_primitive!(DataType::Float(FloatSize::b64), f64, read_f64, write_f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_dtypes() {
        use DataType::*;
        let strs = vec![
            (r#""bool""#, Bool),
            (r#""int8""#, Int(IntSize::b8)),
            (r#""int16""#, Int(IntSize::b16)),
            (r#""int32""#, Int(IntSize::b32)),
            (r#""int64""#, Int(IntSize::b64)),
            (r#""uint8""#, UInt(IntSize::b8)),
            (r#""uint16""#, UInt(IntSize::b16)),
            (r#""uint32""#, UInt(IntSize::b32)),
            (r#""uint64""#, UInt(IntSize::b64)),
            (r#""float32""#, Float(FloatSize::b32)),
            (r#""float64""#, Float(FloatSize::b64)),
        ];
        for (s, expected) in strs {
            let dt: DataType =
                serde_json::from_str(s).unwrap_or_else(|_| panic!("Couldn't parse '{}'", s));
            assert_eq!(dt, expected);

            let s2 = serde_json::to_string(&dt)
                .unwrap_or_else(|_| panic!("Couldn't serialize {:?}", dt));
            assert_eq!(s, &s2);
        }
    }

    #[test]
    fn rejects_unknown_dtype() {
        assert!("float16".parse::<DataType>().is_err());
        assert!("complex64".parse::<DataType>().is_err());
        assert!("uint".parse::<DataType>().is_err());
        assert!("".parse::<DataType>().is_err());
    }

    #[test]
    fn element_roundtrip() {
        let mut buf = Vec::new();
        1.5f32.write_to(&mut buf).unwrap();
        (-7i64).write_to(&mut buf).unwrap();
        true.write_to(&mut buf).unwrap();

        let mut r = buf.as_slice();
        assert_eq!(f32::read_from(&mut r).unwrap(), 1.5);
        assert_eq!(i64::read_from(&mut r).unwrap(), -7);
        assert!(bool::read_from(&mut r).unwrap());
        assert!(r.is_empty());
    }

    #[test]
    fn element_bytes_are_little_endian() {
        let mut buf = Vec::new();
        0x0102_0304u32.write_to(&mut buf).unwrap();
        assert_eq!(buf, vec![0x04, 0x03, 0x02, 0x01]);
    }
}
