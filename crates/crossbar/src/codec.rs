use crate::error::CodecError;

/// Serialization boundary between user messages and wire payloads.
///
/// Injected at bus construction; `In` and `Out` may differ when the two
/// directions of a link speak different schemas.
pub trait MessageCodec: Send + Sync + 'static {
    type In: Send + 'static;
    type Out;

    fn encode(&self, msg: &Self::Out) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Self::In, CodecError>;
}

/// String messages as raw UTF-8.
#[derive(Clone, Copy, Debug, Default)]
pub struct Utf8Codec;

impl MessageCodec for Utf8Codec {
    type In = String;
    type Out = String;

    fn encode(&self, msg: &String) -> Result<Vec<u8>, CodecError> {
        Ok(msg.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(CodecError::new)
    }
}

/// Bitcode-backed codec for any serde type.
#[cfg(feature = "bitcode")]
pub struct BitcodeCodec<T>(std::marker::PhantomData<fn() -> T>);

#[cfg(feature = "bitcode")]
impl<T> Default for BitcodeCodec<T> {
    fn default() -> Self {
        Self(std::marker::PhantomData)
    }
}

#[cfg(feature = "bitcode")]
impl<T> MessageCodec for BitcodeCodec<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    type In = T;
    type Out = T;

    fn encode(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        bitcode::serialize(msg).map_err(CodecError::new)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bitcode::deserialize(bytes).map_err(CodecError::new)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn utf8_roundtrip() {
        let codec = Utf8Codec;
        let bytes = codec.encode(&"héllo".to_string()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), "héllo");
    }

    #[test]
    fn utf8_rejects_invalid_bytes() {
        assert!(Utf8Codec.decode(&[0xff, 0xfe]).is_err());
    }

    #[cfg(feature = "bitcode")]
    #[test]
    fn bitcode_roundtrip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Ping {
            seq: u64,
            body: String,
        }

        let codec = BitcodeCodec::<Ping>::default();
        let msg = Ping { seq: 7, body: "pong".into() };
        let bytes = codec.encode(&msg).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), msg);
    }
}
