use std::fmt;

/// Compressed-header endpoint id: an `ipn:node.service` pair.
///
/// Ordering is lexicographic on (node, service) so the catalog can key its
/// destination map on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Eid {
    pub node_id: u64,
    pub service_id: u64,
}

impl Eid {
    pub const fn new(node_id: u64, service_id: u64) -> Self {
        Self {
            node_id,
            service_id,
        }
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipn:{}.{}", self.node_id, self.service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::Eid;

    #[test]
    fn orders_by_node_then_service() {
        assert!(Eid::new(1, 9) < Eid::new(2, 0));
        assert!(Eid::new(3, 1) < Eid::new(3, 2));
        assert_eq!(Eid::new(5, 5), Eid::new(5, 5));
    }

    #[test]
    fn displays_as_ipn_uri() {
        assert_eq!(Eid::new(10, 1).to_string(), "ipn:10.1");
    }
}
