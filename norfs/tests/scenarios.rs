//! End-to-end scenarios against [`MemoryFlash`], covering the small/big
//! file boundary, directory garbage collection, superblock rotation, and
//! wear-leveling churn.

use norfs::{Config, EntryKind, Filesystem, SeekFrom};
use norfs_flash_mem::MemoryFlash;

fn small_cfg() -> Config {
    Config::new(16, 16, 1024, 64, 64, 4)
}

#[test]
fn small_file_round_trip_survives_remount() {
    let flash = MemoryFlash::new(small_cfg().sector_size, small_cfg().sector_count);
    let mut fs = Filesystem::format(flash, small_cfg()).unwrap();

    let f = fs.open_file(b"/hello.txt", true).unwrap();
    let n = fs.write(&f, b"hello, flash").unwrap();
    assert_eq!(n, 12);
    fs.close_file(f).unwrap();
    fs.sync().unwrap();

    let flash = fs.into_driver();
    let mut fs = Filesystem::mount(flash, small_cfg()).unwrap();

    let f = fs.open_file(b"/hello.txt", false).unwrap();
    assert_eq!(fs.file_size(&f).unwrap(), 12);
    let mut buf = [0u8; 12];
    let n = fs.read(&f, &mut buf).unwrap();
    assert_eq!(n, 12);
    assert_eq!(&buf, b"hello, flash");
    fs.close_file(f).unwrap();
}

#[test]
fn crossing_inline_threshold_promotes_to_big_file() {
    let cfg = small_cfg();
    let flash = MemoryFlash::new(cfg.sector_size, cfg.sector_count);
    let mut fs = Filesystem::format(flash, cfg.clone()).unwrap();

    // FILE_SIZE_THRESHOLD is 64 bytes; 65 crosses it in a single write.
    let payload = vec![0xABu8; 65];
    let f = fs.open_file(b"/big.bin", true).unwrap();
    fs.write(&f, &payload).unwrap();
    fs.close_file(f).unwrap();
    fs.sync().unwrap();

    let flash = fs.into_driver();
    let mut fs = Filesystem::mount(flash, cfg).unwrap();
    let f = fs.open_file(b"/big.bin", false).unwrap();
    assert_eq!(fs.file_size(&f).unwrap(), 65);
    let mut buf = vec![0u8; 65];
    fs.read(&f, &mut buf).unwrap();
    assert_eq!(buf, payload);
    fs.close_file(f).unwrap();
}

#[test]
fn random_write_into_middle_of_big_file() {
    let cfg = small_cfg();
    let flash = MemoryFlash::new(cfg.sector_size, cfg.sector_count);
    let mut fs = Filesystem::format(flash, cfg).unwrap();

    let original = vec![b'A'; 200];
    let f = fs.open_file(b"/big.bin", true).unwrap();
    fs.write(&f, &original).unwrap();

    fs.seek(&f, SeekFrom::Start(50)).unwrap();
    let patch = vec![b'X'; 10];
    fs.write(&f, &patch).unwrap();

    fs.seek(&f, SeekFrom::Start(0)).unwrap();
    let mut buf = vec![0u8; 200];
    let n = fs.read(&f, &mut buf).unwrap();
    assert_eq!(n, 200);

    let mut expected = original;
    expected[50..60].copy_from_slice(&patch);
    assert_eq!(buf, expected);
    fs.close_file(f).unwrap();
}

#[test]
fn directory_gc_compacts_after_bulk_delete() {
    // Deliberately small sector_size so deleting half of sixty inline
    // files' worth of name+data records comfortably crosses the
    // 3*sector_size dead-space threshold that triggers a GC pass.
    let cfg = Config::new(16, 16, 256, 64, 32, 4);
    let flash = MemoryFlash::new(cfg.sector_size, cfg.sector_count);
    let mut fs = Filesystem::format(flash, cfg).unwrap();

    fs.mkdir(b"/d").unwrap();
    let dir = fs.open_dir(b"/d").unwrap();

    const N: usize = 60;
    for i in 0..N {
        let path = format!("/d/f{i:02}");
        let f = fs.open_file(path.as_bytes(), true).unwrap();
        fs.write(&f, format!("contents of file {i:02}").as_bytes()).unwrap();
        fs.close_file(f).unwrap();
    }

    for i in (0..N).step_by(2) {
        let path = format!("/d/f{i:02}");
        fs.delete(path.as_bytes()).unwrap();
    }

    fs.sync().unwrap();

    let entries = fs.readdir(&dir).unwrap();
    assert_eq!(entries.len(), N / 2);
    for (name, kind) in &entries {
        assert_eq!(*kind, EntryKind::File);
        let i: usize = std::str::from_utf8(&name[1..]).unwrap().parse().unwrap();
        assert_eq!(i % 2, 1);
    }

    fs.close_dir(dir).unwrap();
}

#[test]
fn superblock_rotation_survives_extension_wraparound() {
    // A tiny superblock sector forces a rotation on almost every sync;
    // looping well past 64/2 rotations exercises the extension counter
    // wrapping back through its reserved value and the mount-time
    // active-sector tiebreak that has to handle it.
    let cfg = Config::new(16, 16, 128, 8, 16, 2);
    let flash = MemoryFlash::new(cfg.sector_size, cfg.sector_count);
    let mut fs = Filesystem::format(flash, cfg.clone()).unwrap();

    for _ in 0..40 {
        fs.sync().unwrap();
    }

    let flash = fs.into_driver();
    let fs = Filesystem::mount(flash, cfg).unwrap();
    drop(fs);
}

#[test]
fn wear_leveling_churn_preserves_data_across_remounts() {
    // A low wl_start makes region swaps trip often under ordinary
    // allocation churn instead of needing thousands of real erase
    // cycles; three mount/unmount cycles of file churn exercise several
    // such swaps back to back.
    let mut cfg = Config::new(16, 16, 512, 64, 32, 4);
    cfg.set_wl_start(3);
    let flash = MemoryFlash::new(cfg.sector_size, cfg.sector_count);
    let mut fs = Filesystem::format(flash, cfg.clone()).unwrap();

    let mut flash = None;
    for round in 0..3 {
        if let Some(driver) = flash.take() {
            fs = Filesystem::mount(driver, cfg.clone()).unwrap();
        }
        for i in 0..20 {
            let path = format!("/r{round}f{i}");
            let f = fs.open_file(path.as_bytes(), true).unwrap();
            fs.write(&f, format!("round {round} file {i} payload").as_bytes()).unwrap();
            fs.close_file(f).unwrap();
        }
        for i in (0..20).step_by(3) {
            let path = format!("/r{round}f{i}");
            fs.delete(path.as_bytes()).unwrap();
        }
        fs.sync().unwrap();
        flash = Some(fs.into_driver());
    }

    let mut fs = Filesystem::mount(flash.take().unwrap(), cfg).unwrap();
    for round in 0..3 {
        for i in 0..20 {
            let path = format!("/r{round}f{i}");
            let expected = format!("round {round} file {i} payload");
            let f = fs.open_file(path.as_bytes(), false);
            if i % 3 == 0 {
                assert!(f.is_err(), "deleted file {path} should stay gone");
                continue;
            }
            let f = f.unwrap();
            let mut buf = vec![0u8; expected.len()];
            fs.read(&f, &mut buf).unwrap();
            assert_eq!(buf, expected.as_bytes());
            fs.close_file(f).unwrap();
        }
    }
}
