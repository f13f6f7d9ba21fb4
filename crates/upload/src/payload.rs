/// How the records of one batch are joined into a single request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFormat {
    pub prefix: Vec<u8>,
    pub separator: Vec<u8>,
    pub suffix: Vec<u8>,
}

impl PayloadFormat {
    /// `[a,b,c]`, for intakes that take a JSON array.
    pub fn json_array() -> Self {
        Self {
            prefix: b"[".to_vec(),
            separator: b",".to_vec(),
            suffix: b"]".to_vec(),
        }
    }

    /// One record per line.
    pub fn newline_delimited() -> Self {
        Self {
            prefix: Vec::new(),
            separator: b"\n".to_vec(),
            suffix: Vec::new(),
        }
    }

    pub fn join<'a>(&self, events: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
        let mut payload = self.prefix.clone();
        for (i, event) in events.into_iter().enumerate() {
            if i > 0 {
                payload.extend_from_slice(&self.separator);
            }
            payload.extend_from_slice(event);
        }
        payload.extend_from_slice(&self.suffix);
        payload
    }
}

impl Default for PayloadFormat {
    fn default() -> Self {
        Self::json_array()
    }
}
