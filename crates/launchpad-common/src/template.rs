/// Body of a rendered template file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

/// One file of a rendered template set, addressed by its repository path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFile {
    /// Forward-slash separated path relative to the repository root.
    pub path: String,
    pub content: FileContent,
}

impl TemplateFile {
    pub fn text(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: FileContent::Text(content.into()),
        }
    }

    pub fn binary(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content: FileContent::Binary(content),
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.content, FileContent::Binary(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.content {
            FileContent::Text(s) => s.as_bytes(),
            FileContent::Binary(b) => b,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            FileContent::Text(s) => Some(s),
            FileContent::Binary(_) => None,
        }
    }
}
