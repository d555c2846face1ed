//! VRT mosaics over GeoTIFF members.

mod common;

use std::sync::Arc;

use catalog_common::{BoundingBox, Crs};
use data_catalog::{CatalogEntry, DataType, Driver};
use remote_access::{
    AccessStats, Credentials, RangeReader, RasterSource, ReaderFactory, RetryPolicy, Scheme,
    StorageLocation, StoreResolver, Window,
};
use remote_access::raster::VrtSource;
use test_utils::{memory_store, memory_uri, put_object, vrt_mosaic, GeoTiffBuilder, VrtMember, TEST_BUCKET};

use common::accessor_with;

const MOSAIC_GT: [f64; 6] = [0.0, 1.0, 0.0, 20.0, 0.0, -1.0];

fn member_tif() -> Vec<u8> {
    GeoTiffBuilder::new(20, 20).tiled(16, 16).epsg(6344).build()
}

fn two_member_vrt() -> String {
    vrt_mosaic(
        40,
        20,
        MOSAIC_GT,
        Some(6344),
        None,
        &[
            VrtMember::relative("tiles/west.tif", 20, 20, 0, 0),
            VrtMember::relative("tiles/east.tif", 20, 20, 20, 0),
        ],
    )
}

fn vrt_entry(name: &str, key: &str) -> CatalogEntry {
    CatalogEntry::new(name, DataType::Raster, Driver::Raster, memory_uri(key))
}

#[tokio::test]
async fn test_mosaic_window_spans_members() {
    let accessor = accessor_with(vec![
        ("mosaic/dem.vrt", two_member_vrt().into_bytes()),
        ("mosaic/tiles/west.tif", member_tif()),
        ("mosaic/tiles/east.tif", member_tif()),
    ])
    .await;

    let dataset = accessor
        .open(&vrt_entry("dem", "mosaic/dem.vrt"), None)
        .await
        .unwrap()
        .into_raster()
        .unwrap();
    assert_eq!(accessor.stats().snapshot().requests, 1, "only the VRT document");
    assert_eq!(dataset.shape(), (20, 40));
    assert_eq!(dataset.crs(), Some(&Crs::Epsg(6344)));
    assert_eq!(dataset.variable_names(), vec!["dem"]);

    let array = dataset
        .read_window("dem", Window::new(15, 5, 10, 4))
        .await
        .unwrap();
    for row in 0..4 {
        for col in 0..10 {
            let (r, c) = (5 + row, 15 + col);
            let expected = if c < 20 { r * 20 + c } else { r * 20 + (c - 20) };
            assert_eq!(array.get(row, col), Some(expected as f64), "pixel ({}, {})", r, c);
        }
    }
}

#[tokio::test]
async fn test_members_open_on_first_touch() {
    let store = memory_store();
    put_object(&store, "mosaic/dem.vrt", two_member_vrt()).await;
    put_object(&store, "mosaic/tiles/west.tif", member_tif()).await;
    put_object(&store, "mosaic/tiles/east.tif", member_tif()).await;

    let resolver = Arc::new(StoreResolver::new());
    resolver.register_store(Scheme::Memory, TEST_BUCKET, store);
    let stats = AccessStats::new();
    let factory = ReaderFactory::new(resolver, Credentials::anonymous(), RetryPolicy::none(), stats.clone());

    let location = StorageLocation::parse(&memory_uri("mosaic/dem.vrt")).unwrap();
    let reader: Arc<dyn RangeReader> = Arc::new(factory.reader(&location).unwrap());
    let vrt = VrtSource::open(&location, reader, factory.clone(), 16384, 1 << 20)
        .await
        .unwrap();

    assert_eq!(vrt.member_count(), 2);
    assert_eq!(vrt.opened_members(), 0);

    let west = vrt.read_window(0, Window::new(2, 2, 5, 5)).await.unwrap();
    assert_eq!(vrt.opened_members(), 1);
    assert_eq!(west[0], (2 * 20 + 2) as f64);

    vrt.read_window(0, Window::new(30, 0, 5, 5)).await.unwrap();
    assert_eq!(vrt.opened_members(), 2);
}

#[tokio::test]
async fn test_members_share_one_cache_budget() {
    let vrt = vrt_mosaic(
        40,
        40,
        [0.0, 1.0, 0.0, 40.0, 0.0, -1.0],
        Some(6344),
        None,
        &[
            VrtMember::relative("q/nw.tif", 20, 20, 0, 0),
            VrtMember::relative("q/ne.tif", 20, 20, 20, 0),
            VrtMember::relative("q/sw.tif", 20, 20, 0, 20),
            VrtMember::relative("q/se.tif", 20, 20, 20, 20),
        ],
    );
    let store = memory_store();
    put_object(&store, "quad/dem.vrt", vrt).await;
    for name in ["nw", "ne", "sw", "se"] {
        put_object(&store, &format!("quad/q/{}.tif", name), member_tif()).await;
    }

    let resolver = Arc::new(StoreResolver::new());
    resolver.register_store(Scheme::Memory, TEST_BUCKET, store);
    let factory = ReaderFactory::new(resolver, Credentials::anonymous(), RetryPolicy::none(), AccessStats::new());
    let location = StorageLocation::parse(&memory_uri("quad/dem.vrt")).unwrap();
    let reader: Arc<dyn RangeReader> = Arc::new(factory.reader(&location).unwrap());

    // Each member decodes four 16x16 tiles of 2048 bytes; the budget fits four.
    let budget = 10_000;
    let vrt = VrtSource::open(&location, reader, factory, 16384, budget).await.unwrap();

    let all = vrt.read_window(0, Window::new(0, 0, 40, 40)).await.unwrap();
    assert_eq!(vrt.opened_members(), 4);
    for (row, col) in [(0, 0), (5, 25), (33, 7), (39, 39)] {
        assert_eq!(all[row * 40 + col], ((row % 20) * 20 + col % 20) as f64);
    }

    let stats = vrt.cache_stats().await;
    assert!(stats.memory_bytes <= budget as u64, "cached {} bytes", stats.memory_bytes);
    assert!(stats.entries <= 4);
    assert!(stats.evictions >= 12);

    let corner = vrt.read_window(0, Window::new(39, 39, 1, 1)).await.unwrap();
    assert_eq!(corner, vec![399.0]);
    assert!(vrt.cache_stats().await.memory_bytes <= budget as u64);
}

#[tokio::test]
async fn test_absolute_vsis3_member() {
    let vrt = vrt_mosaic(
        40,
        20,
        MOSAIC_GT,
        Some(6344),
        None,
        &[
            VrtMember::relative("west.tif", 20, 20, 0, 0),
            VrtMember::absolute("/vsis3/noaa-nos-coastal-lidar-pds/dem/east.tif", 20, 20, 20, 0),
        ],
    );
    let accessor = accessor_with(vec![
        ("mixed/dem.vrt", vrt.into_bytes()),
        ("mixed/west.tif", member_tif()),
    ])
    .await;

    let s3 = memory_store();
    put_object(&s3, "dem/east.tif", GeoTiffBuilder::new(20, 20).fill_with(|_, _, _| 42.0).build()).await;
    accessor.register_store(Scheme::S3, "noaa-nos-coastal-lidar-pds", s3);

    let dataset = accessor
        .open(&vrt_entry("dem", "mixed/dem.vrt"), None)
        .await
        .unwrap()
        .into_raster()
        .unwrap();

    let array = dataset.read_window("dem", Window::new(18, 0, 4, 1)).await.unwrap();
    assert_eq!(array.data, vec![18.0, 19.0, 42.0, 42.0]);
}

#[tokio::test]
async fn test_uncovered_pixels_are_nodata() {
    let vrt = vrt_mosaic(
        40,
        20,
        MOSAIC_GT,
        None,
        Some(-9999.0),
        &[VrtMember::relative("west.tif", 20, 20, 0, 0)],
    );
    let accessor = accessor_with(vec![
        ("gap/dem.vrt", vrt.into_bytes()),
        ("gap/west.tif", member_tif()),
    ])
    .await;

    let dataset = accessor
        .open(&vrt_entry("dem", "gap/dem.vrt"), None)
        .await
        .unwrap()
        .into_raster()
        .unwrap();
    assert_eq!(dataset.crs(), None);

    let before = accessor.stats().snapshot();
    let east = dataset
        .clip_bbox(&BoundingBox::new(25.0, 5.0, 35.0, 15.0), 0)
        .unwrap()
        .read_variable("dem")
        .await
        .unwrap();
    assert_eq!(accessor.stats().snapshot().since(&before).requests, 0, "west member never opened");
    assert_eq!(east.nodata, Some(-9999.0));
    assert_eq!(east.valid_count(), 0);
    assert!(east.stats().is_none());

    let straddling = dataset.read_window("dem", Window::new(19, 0, 2, 1)).await.unwrap();
    assert_eq!(straddling.data, vec![19.0, -9999.0]);
}
