//! Tests for BoundingBox parsing and geometry helpers.

use catalog_common::bbox::{BboxParseError, BoundingBox};

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn test_parse_projected_extent() {
    // Web Mercator grid origin used by the Lower Colorado test case
    let bbox = BoundingBox::parse("-10687089,3321498,-10674589,3329048").unwrap();
    assert_eq!(bbox.min_x, -10687089.0);
    assert_eq!(bbox.max_y, 3329048.0);
}

#[test]
fn test_parse_tolerates_spaces() {
    let bbox = BoundingBox::parse(" -96.2, 28.5 , -95.9,28.7 ").unwrap();
    assert_eq!(bbox, BoundingBox::new(-96.2, 28.5, -95.9, 28.7));
}

#[test]
fn test_parse_too_few() {
    let result = BoundingBox::parse("0,0,100");
    assert!(matches!(result, Err(BboxParseError::InvalidFormat(_))));
}

#[test]
fn test_parse_too_many() {
    let result = BoundingBox::parse("0,0,100,100,200");
    assert!(matches!(result, Err(BboxParseError::InvalidFormat(_))));
}

#[test]
fn test_parse_invalid_number() {
    let result = BoundingBox::parse("abc,0,100,100");
    assert!(matches!(result, Err(BboxParseError::InvalidNumber(_))));
}

#[test]
fn test_parse_empty_string() {
    let result = BoundingBox::parse("");
    assert!(matches!(result, Err(BboxParseError::InvalidFormat(_))));
}

#[test]
fn test_from_str_matches_parse() {
    let parsed: BoundingBox = "1,2,3,4".parse().unwrap();
    assert_eq!(parsed, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
    assert_eq!(parsed.to_string(), "1,2,3,4");
}

// ============================================================================
// Geometry
// ============================================================================

#[test]
fn test_dimensions() {
    let bbox = BoundingBox::new(-100.0, 5.0, -50.0, 25.0);
    assert_eq!(bbox.width(), 50.0);
    assert_eq!(bbox.height(), 20.0);
}

#[test]
fn test_inverted_is_invalid() {
    assert!(BoundingBox::new(0.0, 0.0, 1.0, 1.0).is_valid());
    assert!(!BoundingBox::new(10.0, 10.0, 0.0, 0.0).is_valid());
}

#[test]
fn test_intersects_symmetric() {
    let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BoundingBox::new(5.0, 5.0, 15.0, 15.0);
    assert!(a.intersects(&b));
    assert!(b.intersects(&a));
}

#[test]
fn test_adjacent_edges_do_not_intersect() {
    let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BoundingBox::new(10.0, 0.0, 20.0, 10.0);
    assert!(!a.intersects(&b));
    assert!(a.intersection(&b).is_none());
}

#[test]
fn test_intersection_with_self() {
    let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    assert_eq!(bbox.intersection(&bbox).unwrap(), bbox);
}

#[test]
fn test_union_and_expand() {
    let a = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
    let b = BoundingBox::new(2.0, -1.0, 3.0, 0.5);
    assert_eq!(a.union(&b), BoundingBox::new(0.0, -1.0, 3.0, 1.0));
    assert_eq!(a.expand(0.5, 1.0), BoundingBox::new(-0.5, -1.0, 1.5, 2.0));
}

#[test]
fn test_contains_point_edges_inclusive() {
    let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    assert!(bbox.contains_point(0.0, 5.0));
    assert!(bbox.contains_point(10.0, 10.0));
    assert!(!bbox.contains_point(-1.0, 5.0));
    assert!(!bbox.contains_point(5.0, 11.0));
}
