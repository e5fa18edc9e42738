//! Assigns imported parts to a place's exported parts by feature-set
//! superset matching, falling back to the bipartite matcher when more than
//! one imported part could use the same candidate. Grounded on spec.md
//! §4.6's matching algorithm and `nmb_protocol::matching`.

use std::collections::{HashMap, HashSet};

use nmb_protocol::matching::{candidate_edges, find_matching};
use nmb_protocol::models::{ImportDesc, Place};

use crate::error::AgentError;

/// One imported part's resolved place-part index.
#[derive(Debug, Clone)]
pub struct MatchedPart {
    pub import_name: String,
    pub place_part_index: usize,
}

/// Matches every part in `import` to a distinct part of `place`, failing if
/// any imported part has no feature-superset candidate or the assignment
/// isn't injective (two imports can't share one physical part).
pub fn match_parts(import: &ImportDesc, place: &Place) -> Result<Vec<MatchedPart>, AgentError> {
    let imported: HashMap<String, HashSet<String>> =
        import.parts.iter().map(|(name, part)| (name.clone(), part.features())).collect();
    let place_parts: Vec<(usize, HashSet<String>)> =
        place.parts.iter().enumerate().map(|(i, part)| (i, Place::part_features(part))).collect();

    let edges = candidate_edges(&imported, &place_parts);
    let matching = find_matching(&edges);

    if matching.len() != import.parts.len() {
        return Err(AgentError::NoMatchingPlace);
    }

    Ok(matching
        .into_iter()
        .map(|(import_name, place_part_index)| MatchedPart { import_name, place_part_index })
        .collect())
}

/// The subset of `places` against which `import` has a complete matching —
/// the candidate set the agent hands to the hub's `reserve` call.
pub fn candidate_place_ids(import: &ImportDesc, places: &[Place]) -> Vec<u64> {
    places.iter().filter(|place| match_parts(import, place).is_ok()).map(|place| place.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmb_protocol::models::{ExportedPart, ImportedPart, TcpExportDesc, TcpImportDesc, UsbExportDesc, UsbId, UsbImportDesc};
    use std::collections::HashMap as Map;

    fn place_with_one_rpi_part() -> Place {
        let mut usb = Map::new();
        usb.insert("board".to_string(), UsbExportDesc { usbid: UsbId::parse("1-2").unwrap() });
        Place {
            id: 1,
            name: "farm-1".into(),
            host: "10.0.0.5".into(),
            port: 8080,
            parts: vec![ExportedPart { compatible: vec!["raspberry-pi".into()], usb, tcp: Map::new() }],
        }
    }

    fn import_matching_rpi() -> ImportDesc {
        let mut usb = Map::new();
        usb.insert("board".to_string(), UsbImportDesc { port_num: 0 });
        let mut parts = Map::new();
        parts.insert(
            "board".to_string(),
            ImportedPart { compatible: vec!["raspberry-pi".into()], usb, tcp: Map::new() },
        );
        ImportDesc { name: "my-rpi".into(), auto_return_time: "10h".into(), parts }
    }

    #[test]
    fn matches_compatible_part() {
        let place = place_with_one_rpi_part();
        let import = import_matching_rpi();
        let matched = match_parts(&import, &place).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].place_part_index, 0);
    }

    #[test]
    fn rejects_place_missing_a_required_feature() {
        let mut place = place_with_one_rpi_part();
        place.parts[0].compatible = vec!["other-board".into()];
        let import = import_matching_rpi();
        assert!(match_parts(&import, &place).is_err());
    }

    #[test]
    fn candidate_place_ids_filters_to_matching_places() {
        let matching_place = place_with_one_rpi_part();
        let mut non_matching = place_with_one_rpi_part();
        non_matching.id = 2;
        non_matching.parts[0].compatible = vec!["other".into()];

        let import = import_matching_rpi();
        let ids = candidate_place_ids(&import, &[matching_place, non_matching]);
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn tcp_features_also_match() {
        let mut tcp = Map::new();
        tcp.insert("ssh".to_string(), TcpExportDesc { host: "127.0.0.1".into(), port: 22 });
        let place = Place {
            id: 1,
            name: "farm-1".into(),
            host: "10.0.0.5".into(),
            port: 8080,
            parts: vec![ExportedPart { compatible: vec![], usb: Map::new(), tcp }],
        };

        let mut tcp_import = Map::new();
        tcp_import.insert("ssh".to_string(), TcpImportDesc { local_port: 2222 });
        let mut parts = Map::new();
        parts.insert("board".to_string(), ImportedPart { compatible: vec![], usb: Map::new(), tcp: tcp_import });
        let import = ImportDesc { name: "my-board".into(), auto_return_time: "10h".into(), parts };

        assert!(match_parts(&import, &place).is_ok());
    }
}
