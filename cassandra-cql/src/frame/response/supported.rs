use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use std::fmt;

/// A SUPPORTED response. Options keep the order they were sent in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Supported {
    pub options: Vec<(String, Vec<String>)>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let options = types::read_string_multimap(buf)?;

        Ok(Supported { options })
    }

    pub fn get(&self, option: &str) -> Option<&[String]> {
        self.options
            .iter()
            .find(|(name, _)| name == option)
            .map(|(_, values)| values.as_slice())
    }

    pub fn supports_compression(&self, algorithm: &str) -> bool {
        self.get(crate::frame::request::startup::COMPRESSION)
            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case(algorithm)))
    }
}

impl fmt::Display for Supported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SUPPORTED {")?;
        for (i, (name, values)) in self.options.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}: {:?}", name, values)?;
        }
        f.write_str("}")
    }
}
