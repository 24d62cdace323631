//! Input resources and their fallback tiers.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub url: String,
    /// Passed verbatim to the demuxer/device, in order.
    #[serde(default)]
    pub options: Vec<(String, String)>,
    /// 0 is the primary tier; higher values are tried only when lower ones fail.
    #[serde(default)]
    pub fallback_priority: u32,
}

impl Resource {
    pub fn new(url: &str, fallback_priority: u32) -> Self {
        Self {
            url: url.to_string(),
            options: Vec::new(),
            fallback_priority,
        }
    }

    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.push((key.to_string(), value.to_string()));
        self
    }
}

/// Resources sharing one fallback priority; they are teed into one input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceGroup {
    pub priority: u32,
    pub resources: Vec<Resource>,
}

/// Partitions `resources` by fallback priority, ascending. Relative order
/// inside a group follows the input order.
pub fn group_by_priority(resources: &[Resource]) -> Vec<ResourceGroup> {
    let mut groups: Vec<ResourceGroup> = Vec::new();
    for resource in resources {
        match groups
            .iter_mut()
            .find(|g| g.priority == resource.fallback_priority)
        {
            Some(group) => group.resources.push(resource.clone()),
            None => groups.push(ResourceGroup {
                priority: resource.fallback_priority,
                resources: vec![resource.clone()],
            }),
        }
    }
    // stable: groups were created in first-seen order, only reorder by key
    groups.sort_by_key(|g| g.priority);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(group: &ResourceGroup) -> Vec<&str> {
        group.resources.iter().map(|r| r.url.as_str()).collect()
    }

    #[test]
    fn test_group_by_priority() {
        let input = vec![
            Resource::new("a", 2),
            Resource::new("b", 1),
            Resource::new("c", 1),
            Resource::new("d", 0),
            Resource::new("e", 2),
        ];
        let groups = group_by_priority(&input);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].priority, 0);
        assert_eq!(urls(&groups[0]), vec!["d"]);
        assert_eq!(groups[1].priority, 1);
        assert_eq!(urls(&groups[1]), vec!["b", "c"]);
        assert_eq!(groups[2].priority, 2);
        assert_eq!(urls(&groups[2]), vec!["a", "e"]);
    }

    #[test]
    fn test_group_by_priority_empty() {
        assert!(group_by_priority(&[]).is_empty());
    }

    #[test]
    fn test_group_by_priority_preserves_elements() {
        let input: Vec<Resource> = (0..20)
            .map(|i| Resource::new(&format!("r{}", i), (i * 7 % 4) as u32))
            .collect();
        let groups = group_by_priority(&input);

        let mut last = None;
        for g in &groups {
            if let Some(last) = last {
                assert!(g.priority > last);
            }
            last = Some(g.priority);
            assert!(g.resources.iter().all(|r| r.fallback_priority == g.priority));
            let expected: Vec<&Resource> = input
                .iter()
                .filter(|r| r.fallback_priority == g.priority)
                .collect();
            assert_eq!(g.resources.iter().collect::<Vec<_>>(), expected);
        }
        let total: usize = groups.iter().map(|g| g.resources.len()).sum();
        assert_eq!(total, input.len());
    }
}
