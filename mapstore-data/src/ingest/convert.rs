//! Conversion from `osmpbf` elements into the mapstore object model.

use std::path::Path;

use mapstore_core::{ObjectKind, OsmNode, OsmRelation, RelationMember, Tags};
use osmpbf::{Element, RelMemberType};

use super::{
    IngestError,
    source::{OsmElement, RawWay},
};

pub(super) fn element(element: Element<'_>, path: &Path) -> Result<OsmElement, IngestError> {
    match element {
        Element::Node(node) => Ok(OsmElement::Node(OsmNode {
            id: node.id(),
            lat: node.lat(),
            lon: node.lon(),
            tags: collect_tags(ObjectKind::Node, node.id(), node.tags())?,
        })),
        Element::DenseNode(node) => Ok(OsmElement::Node(OsmNode {
            id: node.id(),
            lat: node.lat(),
            lon: node.lon(),
            tags: collect_tags(ObjectKind::Node, node.id(), node.tags())?,
        })),
        Element::Way(way) => Ok(OsmElement::Way(RawWay {
            id: way.id(),
            tags: collect_tags(ObjectKind::Way, way.id(), way.tags())?,
            node_ids: way.refs().collect(),
        })),
        Element::Relation(relation) => {
            let members = relation
                .members()
                .map(|member| {
                    let role = member.role().map_err(|source| IngestError::Decode {
                        source,
                        path: path.to_path_buf(),
                    })?;
                    Ok(RelationMember {
                        object_id: member.member_id,
                        kind: member_kind(&member.member_type),
                        role: role.to_owned(),
                    })
                })
                .collect::<Result<Vec<_>, IngestError>>()?;
            Ok(OsmElement::Relation(OsmRelation {
                id: relation.id(),
                tags: collect_tags(ObjectKind::Relation, relation.id(), relation.tags())?,
                members,
            }))
        }
    }
}

const fn member_kind(member_type: &RelMemberType) -> ObjectKind {
    match member_type {
        RelMemberType::Node => ObjectKind::Node,
        RelMemberType::Way => ObjectKind::Way,
        RelMemberType::Relation => ObjectKind::Relation,
    }
}

/// Collect tags, failing on a repeated key.
pub(super) fn collect_tags<'a, T>(kind: ObjectKind, id: i64, tags: T) -> Result<Tags, IngestError>
where
    T: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut collected = Tags::new();
    for (key, value) in tags {
        collected
            .insert(key.to_owned(), value.to_owned())
            .map_err(|source| IngestError::DuplicateTag { kind, id, source })?;
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn collects_tags_in_order() {
        let tags = collect_tags(
            ObjectKind::Way,
            7,
            [("highway", "residential"), ("name", "Mill Lane")],
        )
        .expect("unique keys");
        let keys: Vec<_> = tags.keys().collect();
        assert_eq!(keys, ["highway", "name"]);
    }

    #[rstest]
    fn repeated_key_names_the_object() {
        let err = collect_tags(
            ObjectKind::Relation,
            42,
            [("type", "route"), ("type", "multipolygon")],
        )
        .expect_err("duplicate key");
        match err {
            IngestError::DuplicateTag { kind, id, source } => {
                assert_eq!(kind, ObjectKind::Relation);
                assert_eq!(id, 42);
                assert_eq!(source.key, "type");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[rstest]
    #[case(RelMemberType::Node, ObjectKind::Node)]
    #[case(RelMemberType::Way, ObjectKind::Way)]
    #[case(RelMemberType::Relation, ObjectKind::Relation)]
    fn maps_member_types(#[case] member_type: RelMemberType, #[case] expected: ObjectKind) {
        assert_eq!(member_kind(&member_type), expected);
    }
}
