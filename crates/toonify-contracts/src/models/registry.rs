use indexmap::IndexMap;

pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub description: String,
}

/// Ordered table of image models; the first entry is the default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models
            .get(name)
            .or_else(|| self.models.get(name.trim().trim_start_matches("models/")))
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn default_model(&self) -> Option<&ModelSpec> {
        self.models.values().next()
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, description: &str| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                description: description.to_string(),
            },
        );
    };

    insert(
        DEFAULT_IMAGE_MODEL,
        "gemini",
        "Gemini 2.5 Flash Image, fast image-to-image restyling",
    );
    insert(
        "gemini-3-pro-image-preview",
        "gemini",
        "Gemini 3 Pro Image preview, slower with finer detail",
    );
    insert(
        "dryrun-image-1",
        "dryrun",
        "Offline posterize filter, no network or API key",
    );

    map
}
