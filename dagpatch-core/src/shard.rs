use crate::error::{Error, Result};

/// Rewrites the path segment at a wildcard position into its physical
/// replacement. Output may contain `/` and expand into multiple segments.
pub type ShardHandler = Box<dyn Fn(&str) -> String + Send + Sync>;

enum PatternSegment {
    Literal(String),
    /// `:name` - matches any single segment, passed through unchanged.
    Placeholder,
    Wildcard,
}

struct ShardPattern {
    segments: Vec<PatternSegment>,
    handler: ShardHandler,
}

/// Maps logical paths to physical storage paths.
///
/// Patterns are slash-delimited templates ending in `*`; the wildcard's
/// handler rewrites the segment occupying that position. The registry is
/// owned by its builder - registration order is precedence order, so when
/// two patterns are eligible at the same offset the first registered wins.
#[derive(Default)]
pub struct ShardRouter {
    patterns: Vec<ShardPattern>,
}

impl ShardRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a pattern. The pattern must end in `*`.
    pub fn register<F>(&mut self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let raw: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        if raw.last() != Some(&"*") {
            return Err(Error::InvalidShardPattern(pattern.to_string()));
        }
        let segments = raw
            .iter()
            .map(|s| match *s {
                "*" => PatternSegment::Wildcard,
                s if s.starts_with(':') => PatternSegment::Placeholder,
                s => PatternSegment::Literal(s.to_string()),
            })
            .collect();
        self.patterns.push(ShardPattern {
            segments,
            handler: Box::new(handler),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Rewrites a logical path into physical segments.
    ///
    /// Walks the path one segment at a time, narrowing the set of compatible
    /// patterns: a literal mismatch eliminates a pattern, placeholders and
    /// matching literals keep it alive, and a pattern shorter than the path
    /// simply stops constraining it. The first surviving pattern with a
    /// wildcard at the current offset fires its handler and the replacement
    /// is spliced in; uncovered segments pass through. Handler output is
    /// re-split on `/`, so one logical segment may expand into several
    /// physical ones.
    pub fn rewrite(&self, path: &str) -> Vec<String> {
        let logical: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut alive: Vec<bool> = vec![true; self.patterns.len()];
        let mut physical: Vec<String> = Vec::with_capacity(logical.len());

        for (offset, key) in logical.iter().enumerate() {
            let mut replaced = false;
            for (idx, pattern) in self.patterns.iter().enumerate() {
                if !alive[idx] {
                    continue;
                }
                match pattern.segments.get(offset) {
                    None => {}
                    Some(PatternSegment::Wildcard) => {
                        physical.push((pattern.handler)(key));
                        replaced = true;
                        break;
                    }
                    Some(PatternSegment::Placeholder) => {}
                    Some(PatternSegment::Literal(lit)) if lit == key => {}
                    Some(PatternSegment::Literal(_)) => {
                        alive[idx] = false;
                    }
                }
            }
            if !replaced {
                physical.push(key.to_string());
            }
        }

        // Handler output may contain slashes; normalize by re-splitting.
        physical
            .join("/")
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

impl std::fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRouter")
            .field("patterns", &self.patterns.len())
            .finish()
    }
}
