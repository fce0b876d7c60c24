use anyhow::Result;

use stratumdb::common::types::HEADER_PAGE_ID;
use stratumdb::storage::buffer::BufferPoolError;

mod common;
use common::create_test_buffer_pool;

#[test]
fn test_new_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10, 2)?;

    let (page, page_id) = buffer_pool.new_page()?;
    // page 1 is the reserved header block
    assert!(page_id > HEADER_PAGE_ID);
    {
        let guard = page.read();
        assert_eq!(guard.page_id, page_id);
        assert!(guard.data.iter().all(|&b| b == 0));
    }
    buffer_pool.unpin_page(page_id, false)?;

    Ok(())
}

#[test]
fn test_fetch_round_trip() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10, 2)?;

    let (page, page_id) = buffer_pool.new_page()?;
    {
        let mut guard = page.write();
        guard.data[0..4].copy_from_slice(b"data");
    }
    buffer_pool.unpin_page(page_id, true)?;

    let fetched = buffer_pool.fetch_page(page_id)?;
    {
        let guard = fetched.read();
        assert_eq!(&guard.data[0..4], b"data");
    }
    buffer_pool.unpin_page(page_id, false)?;

    Ok(())
}

#[test]
fn test_unpin_errors() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10, 2)?;

    let (_, page_id) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(page_id, false)?;

    // pin count is already zero
    assert!(matches!(
        buffer_pool.unpin_page(page_id, false),
        Err(BufferPoolError::PageNotPinned(_))
    ));
    // unknown page
    assert!(matches!(
        buffer_pool.unpin_page(9999, false),
        Err(BufferPoolError::PageNotFound(_))
    ));

    Ok(())
}

#[test]
fn test_pool_exhaustion_and_recovery() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3, 2)?;

    let mut pinned = Vec::new();
    for _ in 0..3 {
        pinned.push(buffer_pool.new_page()?.1);
    }

    // every frame is pinned, so both allocation and fetch must fail
    assert!(matches!(
        buffer_pool.new_page(),
        Err(BufferPoolError::PoolExhausted)
    ));
    assert!(matches!(
        buffer_pool.fetch_page(HEADER_PAGE_ID),
        Err(BufferPoolError::PoolExhausted)
    ));

    // releasing one pin makes a frame reclaimable again
    buffer_pool.unpin_page(pinned[0], false)?;
    let (_, new_id) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(new_id, false)?;

    Ok(())
}

#[test]
fn test_eviction_writes_dirty_page_back() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3, 2)?;

    let (page, dirty_id) = buffer_pool.new_page()?;
    {
        let mut guard = page.write();
        guard.data[100..108].copy_from_slice(b"durable!");
    }
    buffer_pool.unpin_page(dirty_id, true)?;

    // Cycle enough pages through the small pool to force the dirty page out.
    for _ in 0..6 {
        let (_, id) = buffer_pool.new_page()?;
        buffer_pool.unpin_page(id, false)?;
    }

    // A fresh fetch must read the written bytes back from disk.
    let fetched = buffer_pool.fetch_page(dirty_id)?;
    {
        let guard = fetched.read();
        assert_eq!(&guard.data[100..108], b"durable!");
    }
    buffer_pool.unpin_page(dirty_id, false)?;

    Ok(())
}

#[test]
fn test_flush_page_clears_dirty() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(4, 2)?;

    let (page, page_id) = buffer_pool.new_page()?;
    {
        let mut guard = page.write();
        guard.data[0] = 0xAB;
    }
    buffer_pool.unpin_page(page_id, true)?;
    buffer_pool.flush_page(page_id)?;

    assert!(matches!(
        buffer_pool.flush_page(12345),
        Err(BufferPoolError::PageNotFound(_))
    ));

    Ok(())
}

#[test]
fn test_flush_all_pages() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(4, 2)?;

    for _ in 0..3 {
        let (page, page_id) = buffer_pool.new_page()?;
        {
            let mut guard = page.write();
            guard.data[7] = 7;
        }
        buffer_pool.unpin_page(page_id, true)?;
    }
    buffer_pool.flush_all_pages()?;

    Ok(())
}

#[test]
fn test_delete_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(4, 2)?;

    let (_, page_id) = buffer_pool.new_page()?;

    // pinned pages cannot be deleted
    assert!(matches!(
        buffer_pool.delete_page(page_id),
        Err(BufferPoolError::PagePinned(_))
    ));

    buffer_pool.unpin_page(page_id, false)?;
    buffer_pool.delete_page(page_id)?;

    // absent pages delete as a no-op
    buffer_pool.delete_page(page_id)?;

    Ok(())
}

#[test]
fn test_pages_survive_eviction_after_delete_cycle() -> Result<()> {
    // delete frees a frame; the freed frame must be reusable without
    // disturbing other resident pages
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3, 2)?;

    let (page_a, a) = buffer_pool.new_page()?;
    {
        page_a.write().data[0] = b'a';
    }
    buffer_pool.unpin_page(a, true)?;

    let (_, b) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(b, false)?;
    buffer_pool.delete_page(b)?;

    let fetched = buffer_pool.fetch_page(a)?;
    assert_eq!(fetched.read().data[0], b'a');
    buffer_pool.unpin_page(a, false)?;

    Ok(())
}
