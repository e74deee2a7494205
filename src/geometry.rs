use imageproc::point::Point;

pub fn distance(p1: Point<f32>, p2: Point<f32>) -> f32 {
    ((p1.x - p2.x).powf(2.0) + (p1.y - p2.y).powf(2.0)).sqrt()
}

/// Orders four arbitrary corner points as [top-left, top-right,
/// bottom-right, bottom-left]. Top-left minimizes x+y, bottom-right
/// maximizes it; the remaining two are split by y-x.
pub fn order_points(points: &[Point<f32>; 4]) -> [Point<f32>; 4] {
    let mut indexed: Vec<(usize, &Point<f32>)> = points.iter().enumerate().collect();

    indexed.sort_by(|(_, a), (_, b)| {
        (a.x + a.y)
            .partial_cmp(&(b.x + b.y))
            .expect("corner coordinates are not NaN")
    });
    let top_left = *indexed[0].1;
    let bottom_right = *indexed[3].1;

    let (a, b) = (*indexed[1].1, *indexed[2].1);
    let (top_right, bottom_left) = if a.y - a.x < b.y - b.x { (a, b) } else { (b, a) };

    [top_left, top_right, bottom_right, bottom_left]
}

/// Area of a closed polygon via the shoelace formula.
pub fn polygon_area(points: &[Point<f32>]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut doubled = 0.0;
    for i in 0..points.len() {
        let p = points[i];
        let q = points[(i + 1) % points.len()];
        doubled += p.x * q.y - q.x * p.y;
    }
    (doubled / 2.0).abs()
}

/// Cosine of the angle at `p0` between rays toward `p1` and `p2`.
fn corner_cosine(p1: Point<f32>, p2: Point<f32>, p0: Point<f32>) -> f32 {
    let dx1 = p1.x - p0.x;
    let dy1 = p1.y - p0.y;
    let dx2 = p2.x - p0.x;
    let dy2 = p2.y - p0.y;
    (dx1 * dx2 + dy1 * dy2)
        / (((dx1 * dx1 + dy1 * dy1) * (dx2 * dx2 + dy2 * dy2)) + 1e-10).sqrt()
}

/// Largest absolute corner cosine of a quadrilateral. Near 0 for right
/// angles; 0.5 admits perspective skew up to roughly 60 degrees.
pub fn max_corner_cosine(quad: &[Point<f32>; 4]) -> f32 {
    let mut max_cosine: f32 = 0.0;
    for i in 2..5 {
        let cosine = corner_cosine(quad[i % 4], quad[i - 2], quad[i - 1]).abs();
        max_cosine = max_cosine.max(cosine);
    }
    max_cosine
}

/// Checks that four detected corner points [TL, TR, BL, BR] form a
/// plausible axis-aligned-ish rectangle spanning at least half the image.
/// Guards against applying a perspective warp to a bogus detection.
pub fn is_plausible_rectangle(
    top_left: Point<f32>,
    top_right: Point<f32>,
    bottom_left: Point<f32>,
    bottom_right: Point<f32>,
    image_width: f32,
    image_height: f32,
) -> bool {
    let top_width = distance(top_left, top_right);
    let bottom_width = distance(bottom_left, bottom_right);
    let left_height = distance(top_left, bottom_left);
    let right_height = distance(top_right, bottom_right);

    if (top_width - bottom_width).abs() > top_width * 0.2 {
        return false;
    }
    if (left_height - right_height).abs() > left_height * 0.2 {
        return false;
    }

    let avg_width = (top_width + bottom_width) / 2.0;
    let avg_height = (left_height + right_height) / 2.0;
    avg_width >= image_width * 0.5 && avg_height >= image_height * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: f32, y: f32) -> Point<f32> {
        Point::new(x, y)
    }

    #[test]
    fn orders_shuffled_corners() {
        let ordered = order_points(&[p(90.0, 5.0), p(0.0, 0.0), p(5.0, 100.0), p(95.0, 95.0)]);
        assert_eq!(ordered[0], p(0.0, 0.0));
        assert_eq!(ordered[1], p(90.0, 5.0));
        assert_eq!(ordered[2], p(95.0, 95.0));
        assert_eq!(ordered[3], p(5.0, 100.0));
    }

    #[test]
    fn shoelace_area_of_unit_square() {
        let square = [p(0.0, 0.0), p(1.0, 0.0), p(1.0, 1.0), p(0.0, 1.0)];
        assert!((polygon_area(&square) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn right_angled_quad_has_low_max_cosine() {
        let quad = [p(0.0, 0.0), p(100.0, 0.0), p(100.0, 100.0), p(0.0, 100.0)];
        assert!(max_corner_cosine(&quad) < 0.1);
    }

    #[test]
    fn degenerate_quad_has_high_max_cosine() {
        let quad = [p(0.0, 0.0), p(100.0, 1.0), p(200.0, 2.0), p(0.0, 100.0)];
        assert!(max_corner_cosine(&quad) > 0.5);
    }

    #[test]
    fn collapsed_detection_is_not_plausible() {
        assert!(!is_plausible_rectangle(
            p(40.0, 40.0),
            p(60.0, 40.0),
            p(40.0, 60.0),
            p(60.0, 60.0),
            200.0,
            200.0,
        ));
    }

    #[test]
    fn full_span_rectangle_is_plausible() {
        assert!(is_plausible_rectangle(
            p(5.0, 5.0),
            p(195.0, 6.0),
            p(4.0, 194.0),
            p(196.0, 195.0),
            200.0,
            200.0,
        ));
    }
}
