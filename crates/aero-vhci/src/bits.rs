/// Serializes a bitflags register as its raw integer value and accepts any raw value back,
/// keeping bits this crate has no name for.
macro_rules! impl_bits_serde {
    ($ty:ty, $raw:ty) => {
        impl ::serde::Serialize for $ty {
            fn serialize<S: ::serde::Serializer>(
                &self,
                serializer: S,
            ) -> ::core::result::Result<S::Ok, S::Error> {
                ::serde::Serialize::serialize(&self.bits(), serializer)
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $ty {
            fn deserialize<D: ::serde::Deserializer<'de>>(
                deserializer: D,
            ) -> ::core::result::Result<Self, D::Error> {
                let raw = <$raw as ::serde::Deserialize>::deserialize(deserializer)?;
                Ok(Self::from_bits_retain(raw))
            }
        }
    };
}
