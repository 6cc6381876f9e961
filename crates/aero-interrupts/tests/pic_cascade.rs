use aero_interrupts::Pic;

#[test]
fn irq2_is_not_user_visible() {
    let mut pic = Pic::new();
    // Unmask everything so priority alone decides the outcome.
    pic.io_write(0x21, 0x00);
    pic.io_write(0xA1, 0x00);

    pic.raise_irq(2);
    assert!(!pic.has_interrupt(), "line 2 is the cascade input, not a guest-visible IRQ");
}

#[test]
fn master_line_takes_priority_over_slave() {
    let mut pic = Pic::new();
    pic.io_write(0x21, 0x00);
    pic.io_write(0xA1, 0x00);
    // ICW2 vector bases: master 0x08, slave 0x70 (BIOS defaults).
    pic.io_write(0x20, 0x11);
    pic.io_write(0x21, 0x08);
    pic.io_write(0x21, 0x04);
    pic.io_write(0x21, 0x01);
    pic.io_write(0xA0, 0x11);
    pic.io_write(0xA1, 0x70);
    pic.io_write(0xA1, 0x02);
    pic.io_write(0xA1, 0x01);
    pic.io_write(0x21, 0x00);
    pic.io_write(0xA1, 0x00);

    pic.raise_irq(9); // slave line 1
    pic.raise_irq(1); // master line 1, higher priority
    assert!(pic.has_interrupt());
    assert_eq!(pic.get_interrupt(), Some(0x08 + 1));
    // Slave interrupt is still pending behind the cascade.
    assert!(pic.has_interrupt());
    assert_eq!(pic.get_interrupt(), Some(0x70 + 1));
}

#[test]
fn acknowledge_clears_irr_and_sets_isr_read_via_ocw3() {
    let mut pic = Pic::new();
    pic.io_write(0x21, 0x00);
    pic.io_write(0xA1, 0x00);

    pic.raise_irq(3);
    assert_eq!(pic.get_interrupt(), Some(3));

    // OCW3 read-ISR select, then IRR select on the master command port.
    pic.io_write(0x20, 0x0B);
    assert_eq!(pic.io_read(0x20) & (1 << 3), 1 << 3, "ISR bit must be set after acknowledge");
    pic.io_write(0x20, 0x0A);
    assert_eq!(pic.io_read(0x20) & (1 << 3), 0, "IRR bit must clear on edge acknowledge");

    // Non-specific EOI (0x20) clears the ISR bit.
    pic.io_write(0x20, 0x20);
    pic.io_write(0x20, 0x0B);
    assert_eq!(pic.io_read(0x20) & (1 << 3), 0, "ISR bit must clear after EOI");
}

#[test]
fn masked_line_never_asserts() {
    let mut pic = Pic::new();
    pic.io_write(0x21, 0xFF); // all masked
    pic.io_write(0xA1, 0xFF);
    pic.raise_irq(4);
    assert!(!pic.has_interrupt());
}

#[test]
fn reset_clears_pending_and_in_service_state() {
    let mut pic = Pic::new();
    pic.io_write(0x21, 0x00);
    pic.io_write(0xA1, 0x00);
    pic.raise_irq(6);
    assert!(pic.has_interrupt());
    pic.reset();
    assert!(!pic.has_interrupt());
}
